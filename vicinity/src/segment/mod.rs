//! Segments: docId-contiguous pieces of a collection. One memory segment
//! accepts writes, zero or more persist segments serve packed containers.

mod memory;
mod persist;

pub use memory::MemorySegment;
pub use persist::{PersistSegment, PersistSegmentManager};

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::column::ForwardData;
use crate::error::Result;
use crate::meta::ColumnMeta;
use crate::types::{DocId, QueryParams, QueryResult, SegmentId, INVALID_KEY};

/// Lifecycle state of a segment; never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentState {
    Created = 0,
    Writing = 1,
    Dumping = 2,
    Compacting = 3,
    Persist = 4,
}

impl SegmentState {
    pub fn from_u32(value: u32) -> SegmentState {
        match value {
            1 => SegmentState::Writing,
            2 => SegmentState::Dumping,
            3 => SegmentState::Compacting,
            4 => SegmentState::Persist,
            _ => SegmentState::Created,
        }
    }
}

/// Basic stats of a segment, persisted in the version manifest.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SegmentMeta {
    pub segment_id: u32,
    pub state: u32,
    pub doc_count: u64,
    pub index_file_count: u64,
    pub index_file_size: u64,
    pub min_doc_id: u64,
    pub max_doc_id: u64,
    pub min_primary_key: u64,
    pub max_primary_key: u64,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub min_lsn: u64,
    pub max_lsn: u64,
    pub reserved: [u32; 8],
}

const _: () = assert!(std::mem::size_of::<SegmentMeta>() % 64 == 0);

impl SegmentMeta {
    pub fn new(segment_id: SegmentId) -> SegmentMeta {
        let mut meta = SegmentMeta::zeroed();
        meta.segment_id = segment_id;
        meta.min_primary_key = INVALID_KEY;
        meta.min_timestamp = u64::MAX;
        meta.min_lsn = u64::MAX;
        meta
    }

    pub fn segment_state(&self) -> SegmentState {
        SegmentState::from_u32(self.state)
    }

    pub fn set_state(&mut self, state: SegmentState) {
        self.state = state as u32;
    }

    pub fn is_in_range(&self, doc_id: DocId) -> bool {
        doc_id >= self.min_doc_id && doc_id <= self.max_doc_id
    }
}

/// Search surface shared by memory and persist segments.
pub trait Segment: Send + Sync {
    fn segment_id(&self) -> SegmentId;

    fn segment_meta(&self) -> SegmentMeta;

    fn doc_count(&self) -> u64;

    /// Top-k search on one column; results carry resolved forward data.
    fn knn_search(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
    ) -> Result<Vec<QueryResult>>;

    /// Batched variant: one result list per packed query vector.
    fn knn_search_batch(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
        batch: u32,
    ) -> Result<Vec<Vec<QueryResult>>>;

    /// Point lookup by primary key; `INVALID_KEY` when absent here.
    fn kv_search(&self, primary_key: u64) -> Result<QueryResult>;

    fn add_column(&self, meta: &ColumnMeta) -> Result<()>;

    fn remove_column(&self, column_name: &str) -> Result<()>;

    fn is_in_range(&self, doc_id: DocId) -> bool {
        self.segment_meta().is_in_range(doc_id)
    }
}

/// Scoped increment of an active-operation counter; the close path waits on
/// these draining to zero.
pub(crate) struct ActiveGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> ActiveGuard<'a> {
    pub fn new(counter: &'a AtomicU64) -> ActiveGuard<'a> {
        counter.fetch_add(1, Ordering::AcqRel);
        ActiveGuard { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves engine hits into query results, dropping docs whose forward
/// record cannot be read.
pub(crate) fn fill_results(
    hits: Vec<(DocId, f32)>,
    reverse_sort: bool,
    seek: impl Fn(DocId) -> Result<ForwardData>,
) -> Vec<QueryResult> {
    let mut results = Vec::with_capacity(hits.len());
    for (doc_id, score) in hits {
        let forward = match seek(doc_id) {
            Ok(forward) => forward,
            Err(_) => {
                tracing::warn!(doc_id, "forward data missing for search hit");
                continue;
            }
        };
        results.push(QueryResult {
            primary_key: forward.header.primary_key,
            score,
            revision: forward.header.revision,
            forward_data: forward.data,
            lsn: forward.header.lsn,
            reverse_sort,
        });
    }
    results
}
