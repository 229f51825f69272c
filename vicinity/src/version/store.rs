//! Block-level accessors of the manifest storage.

use bytemuck::Zeroable;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::segment::{SegmentMeta, SegmentState};
use crate::storage::{Block, Storage};
use crate::types::SegmentId;

use super::{
    CollectionSummary, VersionHeader, VersionSet, MAX_SEGMENT_COUNT, SEGMENT_BLOCK, SUMMARY_BLOCK,
    VERSION_BLOCK,
};

pub struct VersionStore {
    summary_block: Block,
    version_block: Block,
    segment_block: Block,
    state: Mutex<VersionHeader>,
}

impl VersionStore {
    /// Mounts the manifest storage, initializing the blocks and the first
    /// writing segment on first use.
    pub fn mount(storage: &Storage) -> Result<VersionStore> {
        match storage.get(SUMMARY_BLOCK) {
            Some(_) => Self::load_storage(storage),
            None => Self::init_storage(storage),
        }
    }

    fn init_storage(storage: &Storage) -> Result<VersionStore> {
        let summary_block = storage.append(
            SUMMARY_BLOCK,
            std::mem::size_of::<CollectionSummary>() as u64,
        )?;
        let version_block = storage.append(
            VERSION_BLOCK,
            (std::mem::size_of::<VersionHeader>() + std::mem::size_of::<VersionSet>()) as u64,
        )?;
        let segment_block = storage.append(
            SEGMENT_BLOCK,
            (std::mem::size_of::<SegmentMeta>() * MAX_SEGMENT_COUNT) as u64,
        )?;

        let store = VersionStore {
            summary_block,
            version_block,
            segment_block,
            state: Mutex::new(VersionHeader::zeroed()),
        };
        store.update_collection_summary(&CollectionSummary::zeroed())?;
        store.write_header()?;

        // Every collection starts with one writing segment.
        let mut segment_meta = store.alloc_segment_meta()?;
        segment_meta.set_state(SegmentState::Writing);
        segment_meta.min_doc_id = 0;
        store.update_segment_meta(&segment_meta)?;
        Ok(store)
    }

    fn load_storage(storage: &Storage) -> Result<VersionStore> {
        let summary_block = storage
            .get(SUMMARY_BLOCK)
            .ok_or_else(|| Error::InvalidIndexDataFormat("missing summary block".to_string()))?;
        let version_block = storage
            .get(VERSION_BLOCK)
            .ok_or_else(|| Error::InvalidIndexDataFormat("missing version block".to_string()))?;
        let segment_block = storage
            .get(SEGMENT_BLOCK)
            .ok_or_else(|| Error::InvalidIndexDataFormat("missing segment block".to_string()))?;
        let header: VersionHeader = version_block.fetch_pod(0)?;
        Ok(VersionStore {
            summary_block,
            version_block,
            segment_block,
            state: Mutex::new(header),
        })
    }

    pub fn total_version_count(&self) -> u64 {
        self.state.lock().total_version_count
    }

    pub fn total_segment_count(&self) -> u64 {
        self.state.lock().total_segment_count
    }

    /// Hands out a segment meta: a trailing meta still in `Created` state is
    /// recycled, otherwise a fresh id is allocated.
    pub fn alloc_segment_meta(&self) -> Result<SegmentMeta> {
        let mut state = self.state.lock();
        if state.total_segment_count as usize >= MAX_SEGMENT_COUNT {
            return Err(Error::ExceedLimit(format!(
                "segment count reached {MAX_SEGMENT_COUNT}"
            )));
        }

        if state.total_segment_count > 0 {
            let last_id = (state.total_segment_count - 1) as SegmentId;
            let last: SegmentMeta = self.read_segment_meta(last_id)?;
            if last.segment_state() == SegmentState::Created {
                return Ok(last);
            }
        }

        let meta = SegmentMeta::new(state.total_segment_count as SegmentId);
        self.write_segment_meta(&meta)?;
        state.total_segment_count += 1;
        self.version_block.write_pod(0, &*state)?;
        Ok(meta)
    }

    pub fn get_segment_meta(&self, segment_id: SegmentId) -> Result<SegmentMeta> {
        if segment_id as u64 >= self.state.lock().total_segment_count {
            return Err(Error::ExceedLimit(format!(
                "segment id {segment_id} not allocated"
            )));
        }
        self.read_segment_meta(segment_id)
    }

    pub fn update_segment_meta(&self, meta: &SegmentMeta) -> Result<()> {
        let state = self.state.lock();
        if meta.segment_id as u64 >= state.total_segment_count {
            return Err(Error::ExceedLimit(format!(
                "segment id {} not allocated",
                meta.segment_id
            )));
        }
        self.write_segment_meta(meta)
    }

    pub fn get_version_set(&self) -> Result<VersionSet> {
        let offset = self.state.lock().current_version_offset;
        self.version_block.fetch_pod(offset)
    }

    /// Publishes a new live set; the single write plus header update is the
    /// atomicity boundary for dump completion.
    pub fn update_version_set(&self, version_set: &VersionSet) -> Result<()> {
        let mut state = self.state.lock();
        let offset = std::mem::size_of::<VersionHeader>() as u64;
        self.version_block.write_pod(offset, version_set)?;
        state.total_version_count += 1;
        state.current_version_offset = offset;
        self.version_block.write_pod(0, &*state)
    }

    pub fn get_collection_summary(&self) -> Result<CollectionSummary> {
        self.summary_block.fetch_pod(0)
    }

    pub fn update_collection_summary(&self, summary: &CollectionSummary) -> Result<()> {
        self.summary_block.write_pod(0, summary)
    }

    fn read_segment_meta(&self, segment_id: SegmentId) -> Result<SegmentMeta> {
        let offset = segment_id as u64 * std::mem::size_of::<SegmentMeta>() as u64;
        self.segment_block.fetch_pod(offset)
    }

    fn write_segment_meta(&self, meta: &SegmentMeta) -> Result<()> {
        let offset = meta.segment_id as u64 * std::mem::size_of::<SegmentMeta>() as u64;
        self.segment_block.write_pod(offset, meta)
    }

    fn write_header(&self) -> Result<()> {
        let state = self.state.lock();
        self.version_block.write_pod(0, &*state)
    }
}
