//! Primary-key → docId mapping over a persistent hash map.

use std::path::Path;

use crate::error::Result;
use crate::storage::{FileId, Snapshot};
use crate::types::{DocId, ReadOptions, INVALID_DOC_ID};

use super::PersistHashMap;

pub struct IdMap {
    snapshot: Snapshot,
    map: PersistHashMap<u64, u64>,
}

impl IdMap {
    pub fn open(dir: &Path, options: ReadOptions) -> Result<IdMap> {
        let snapshot = Snapshot::open(dir, FileId::Id, options)?;
        let map = PersistHashMap::mount(snapshot.data().clone())?;
        Ok(IdMap { snapshot, map })
    }

    pub fn insert(&self, primary_key: u64, doc_id: DocId) -> Result<()> {
        self.map.emplace(&primary_key, &doc_id)
    }

    pub fn has(&self, primary_key: u64) -> bool {
        self.map.has(&primary_key)
    }

    /// Resolves a primary key, `INVALID_DOC_ID` when absent.
    pub fn get_mapping_id(&self, primary_key: u64) -> DocId {
        match self.map.get(&primary_key) {
            Ok(Some(doc_id)) => doc_id,
            _ => INVALID_DOC_ID,
        }
    }

    pub fn remove(&self, primary_key: u64) -> Result<()> {
        self.map.erase(&primary_key)?;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.map.size()
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
