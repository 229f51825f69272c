//! Set of deleted docIds: an append-only delta log backing an in-memory
//! bitmap that readers consult without locking.

use std::path::Path;

use crate::error::{Error, Result};
use crate::storage::{FileId, Snapshot};
use crate::types::{DocId, ReadOptions};

use super::{ConcurrentBitmap, DeltaStore};

pub struct DeleteStore {
    snapshot: Snapshot,
    delta: DeltaStore<u64>,
    bitmap: ConcurrentBitmap,
}

impl DeleteStore {
    /// Opens the store, rebuilding the bitmap from the delta log.
    pub fn open(dir: &Path, options: ReadOptions) -> Result<DeleteStore> {
        let snapshot = Snapshot::open(dir, FileId::Delete, options)?;
        let delta = DeltaStore::mount(snapshot.data().clone())?;

        let bitmap = ConcurrentBitmap::new();
        for pos in 0..delta.count() {
            if let Some(doc_id) = delta.at(pos) {
                bitmap.set(doc_id);
            }
        }

        Ok(DeleteStore {
            snapshot,
            delta,
            bitmap,
        })
    }

    pub fn insert(&self, doc_id: DocId) -> Result<()> {
        if doc_id > ConcurrentBitmap::max_bit() {
            return Err(Error::ExceedLimit(format!(
                "doc id {doc_id} outside delete bitmap range"
            )));
        }
        self.delta.append(&doc_id)?;
        self.bitmap.set(doc_id);
        Ok(())
    }

    /// Lock-free membership test; stale misses are permissible because the
    /// set only grows.
    pub fn has(&self, doc_id: DocId) -> bool {
        self.bitmap.test(doc_id)
    }

    pub fn count(&self) -> u64 {
        self.delta.count()
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
        self.snapshot.close()
    }
}
