//! The version manager: snapshot-backed manifest plus the in-memory
//! current version.

use std::path::Path;

use bytemuck::Zeroable;
use parking_lot::Mutex;

use crate::error::Result;
use crate::segment::{SegmentMeta, SegmentState};
use crate::storage::{FileId, Snapshot};
use crate::types::{ReadOptions, SegmentId};

use super::{CollectionSummary, VersionEdit, VersionSet, VersionStore};

pub struct VersionManager {
    collection_name: String,
    snapshot: Snapshot,
    store: VersionStore,
    current_version: Mutex<Vec<SegmentMeta>>,
}

impl VersionManager {
    /// Opens `data.manifest` and materializes the current version.
    pub fn open(
        collection_name: &str,
        dir: &Path,
        options: ReadOptions,
    ) -> Result<VersionManager> {
        let snapshot = Snapshot::open(dir, FileId::Manifest, options)?;
        let store = VersionStore::mount(snapshot.data())?;

        let mut current_version = Vec::new();
        if store.total_version_count() > 0 {
            let version_set = store.get_version_set()?;
            for i in 0..version_set.segment_count as usize {
                let meta = store.get_segment_meta(version_set.segment_ids[i])?;
                current_version.push(meta);
            }
        }

        tracing::debug!(
            collection = collection_name,
            segments = current_version.len(),
            "opened version manager"
        );
        Ok(VersionManager {
            collection_name: collection_name.to_string(),
            snapshot,
            store,
            current_version: Mutex::new(current_version),
        })
    }

    /// Metas of the segments queries must consult, in apply order.
    pub fn current_version(&self) -> Vec<SegmentMeta> {
        self.current_version.lock().clone()
    }

    pub fn alloc_segment_meta(&self) -> Result<SegmentMeta> {
        self.store.alloc_segment_meta()
    }

    pub fn get_segment_meta(&self, segment_id: SegmentId) -> Result<SegmentMeta> {
        self.store.get_segment_meta(segment_id)
    }

    pub fn update_segment_meta(&self, meta: &SegmentMeta) -> Result<()> {
        self.store.update_segment_meta(meta)
    }

    /// All allocated metas currently in `state`.
    pub fn get_segment_metas(&self, state: SegmentState) -> Result<Vec<SegmentMeta>> {
        let mut metas = Vec::new();
        for id in 0..self.store.total_segment_count() {
            let meta = self.store.get_segment_meta(id as SegmentId)?;
            if meta.segment_state() == state {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    /// Applies an edit to the live set and persists the new version set.
    pub fn apply(&self, edit: &VersionEdit) -> Result<()> {
        let mut current = self.current_version.lock();

        for segment_id in &edit.add_segments {
            let meta = self.store.get_segment_meta(*segment_id)?;
            current.push(meta);
        }
        for segment_id in &edit.delete_segments {
            current.retain(|meta| meta.segment_id != *segment_id);
        }

        let mut version_set = VersionSet::zeroed();
        version_set.segment_count = current.len() as u64;
        for (i, meta) in current.iter().enumerate() {
            version_set.segment_ids[i] = meta.segment_id;
        }
        self.store.update_version_set(&version_set)?;

        tracing::info!(
            collection = %self.collection_name,
            added = ?edit.add_segments,
            deleted = ?edit.delete_segments,
            live = current.len(),
            "applied version edit"
        );
        Ok(())
    }

    pub fn get_collection_summary(&self) -> Result<CollectionSummary> {
        self.store.get_collection_summary()
    }

    pub fn update_collection_summary(&self, summary: &CollectionSummary) -> Result<()> {
        self.store.update_collection_summary(summary)
    }

    pub fn total_segment_count(&self) -> u64 {
        self.store.total_segment_count()
    }

    pub fn file_path(&self) -> &Path {
        self.snapshot.file_path()
    }

    pub fn file_size(&self) -> u64 {
        self.snapshot.file_size()
    }

    pub fn flush(&self) -> Result<()> {
        self.snapshot.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.current_version.lock().clear();
        self.snapshot.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_options() -> ReadOptions {
        ReadOptions {
            use_mmap: true,
            create_new: true,
        }
    }

    #[test]
    fn test_apply_add_then_delete_restores_prestate() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::open("test", dir.path(), create_options()).unwrap();

        let mut meta = manager.alloc_segment_meta().unwrap();
        meta.set_state(SegmentState::Persist);
        manager.update_segment_meta(&meta).unwrap();

        let before = manager.current_version();
        manager
            .apply(&VersionEdit {
                add_segments: vec![meta.segment_id],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(manager.current_version().len(), before.len() + 1);

        manager
            .apply(&VersionEdit {
                delete_segments: vec![meta.segment_id],
                ..Default::default()
            })
            .unwrap();
        let after: Vec<_> = manager
            .current_version()
            .iter()
            .map(|m| m.segment_id)
            .collect();
        let before: Vec<_> = before.iter().map(|m| m.segment_id).collect();
        assert_eq!(after, before);
    }

    #[test]
    fn test_recovery_finds_states() {
        let dir = TempDir::new().unwrap();
        {
            let manager = VersionManager::open("test", dir.path(), create_options()).unwrap();
            let mut dumping = manager.alloc_segment_meta().unwrap();
            dumping.set_state(SegmentState::Dumping);
            manager.update_segment_meta(&dumping).unwrap();
            manager.flush().unwrap();
            manager.close().unwrap();
        }

        let manager = VersionManager::open(
            "test",
            dir.path(),
            ReadOptions {
                use_mmap: true,
                create_new: false,
            },
        )
        .unwrap();
        let writing = manager.get_segment_metas(SegmentState::Writing).unwrap();
        assert_eq!(writing.len(), 1);
        assert_eq!(writing[0].segment_id, 0);
        let dumping = manager.get_segment_metas(SegmentState::Dumping).unwrap();
        assert_eq!(dumping.len(), 1);
        assert_eq!(dumping[0].segment_id, 1);
    }

    #[test]
    fn test_persisted_version_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let manager = VersionManager::open("test", dir.path(), create_options()).unwrap();
            let mut meta = manager.alloc_segment_meta().unwrap();
            meta.set_state(SegmentState::Persist);
            meta.doc_count = 7;
            manager.update_segment_meta(&meta).unwrap();
            manager
                .apply(&VersionEdit {
                    add_segments: vec![meta.segment_id],
                    ..Default::default()
                })
                .unwrap();
            manager.flush().unwrap();
            manager.close().unwrap();
        }

        let manager = VersionManager::open(
            "test",
            dir.path(),
            ReadOptions {
                use_mmap: true,
                create_new: false,
            },
        )
        .unwrap();
        let current = manager.current_version();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].doc_count, 7);
    }
}
