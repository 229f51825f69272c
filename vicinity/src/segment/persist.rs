//! Persist segments: read-only views over packed `data.seg.<id>`
//! containers, plus the manager owning the loaded set.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::column::{ColumnReader, ForwardReader};
use crate::error::{Error, Result};
use crate::meta::{CollectionMeta, ColumnMeta};
use crate::storage::{FileId, MappedContainer};
use crate::store::{DeleteStore, IdMap};
use crate::types::{QueryParams, QueryResult, ReadOptions, SegmentId, INVALID_KEY};

use super::{fill_results, Segment, SegmentMeta};

pub struct PersistSegment {
    collection_name: String,
    meta: Mutex<SegmentMeta>,
    container: Arc<MappedContainer>,
    forward: ForwardReader,
    columns: RwLock<HashMap<String, Arc<ColumnReader>>>,
    delete_store: Arc<DeleteStore>,
    id_map: Arc<IdMap>,
    concurrency: usize,
}

impl PersistSegment {
    /// Maps and validates `data.seg.<id>`, then loads the forward reader
    /// and one column reader per schema column.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        collection_name: &str,
        collection_path: &Path,
        segment_meta: SegmentMeta,
        schema: &CollectionMeta,
        delete_store: Arc<DeleteStore>,
        id_map: Arc<IdMap>,
        concurrency: usize,
        options: ReadOptions,
    ) -> Result<PersistSegment> {
        let path =
            FileId::Segment.segment_file_path(collection_path, segment_meta.segment_id);
        let container = Arc::new(MappedContainer::open(&path, options.use_mmap)?);
        let forward = ForwardReader::load(container.clone(), segment_meta.min_doc_id)?;

        let mut columns = HashMap::new();
        for column_meta in &schema.index_columns {
            let reader = ColumnReader::load(&container, column_meta, concurrency)?;
            columns.insert(column_meta.name.clone(), Arc::new(reader));
        }

        tracing::info!(
            collection = collection_name,
            segment = segment_meta.segment_id,
            doc_count = forward.doc_count(),
            "loaded persist segment"
        );
        Ok(PersistSegment {
            collection_name: collection_name.to_string(),
            meta: Mutex::new(segment_meta),
            container,
            forward,
            columns: RwLock::new(columns),
            delete_store,
            id_map,
            concurrency,
        })
    }

    pub fn index_version(&self) -> &str {
        self.container.version()
    }

    pub fn file_size(&self) -> u64 {
        self.container.file_size()
    }
}

impl Segment for PersistSegment {
    fn segment_id(&self) -> SegmentId {
        self.meta.lock().segment_id
    }

    fn segment_meta(&self) -> SegmentMeta {
        *self.meta.lock()
    }

    fn doc_count(&self) -> u64 {
        self.forward.doc_count()
    }

    fn knn_search(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
    ) -> Result<Vec<QueryResult>> {
        let mut batches = self.knn_search_batch(column_name, query, params, 1)?;
        Ok(batches.pop().unwrap_or_default())
    }

    fn knn_search_batch(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
        batch: u32,
    ) -> Result<Vec<Vec<QueryResult>>> {
        let reader = {
            let columns = self.columns.read();
            columns
                .get(column_name)
                .cloned()
                .ok_or_else(|| Error::InexistentColumn(column_name.to_string()))?
        };

        let delete_store = self.delete_store.clone();
        let filter = move |doc_id: u64| delete_store.has(doc_id);
        let filter_ref: Option<&(dyn Fn(u64) -> bool + Sync)> = if self.delete_store.count() > 0 {
            Some(&filter)
        } else {
            None
        };

        let batches = reader.search_batch(query, params, batch, filter_ref)?;
        let reverse = reader.reverse_sort();
        Ok(batches
            .into_iter()
            .map(|hits| fill_results(hits, reverse, |doc_id| self.forward.seek(doc_id)))
            .collect())
    }

    fn kv_search(&self, primary_key: u64) -> Result<QueryResult> {
        let doc_id = self.id_map.get_mapping_id(primary_key);
        let mut result = QueryResult::default();
        if !self.delete_store.has(doc_id) && self.segment_meta().is_in_range(doc_id) {
            if let Ok(forward) = self.forward.seek(doc_id) {
                if forward.header.primary_key != INVALID_KEY {
                    result.primary_key = forward.header.primary_key;
                    result.revision = forward.header.revision;
                    result.forward_data = forward.data;
                    result.lsn = forward.header.lsn;
                }
            }
        }
        Ok(result)
    }

    /// The container is immutable; an added column becomes an empty shadow
    /// that answers every query with no hits.
    fn add_column(&self, meta: &ColumnMeta) -> Result<()> {
        let mut columns = self.columns.write();
        if columns.contains_key(&meta.name) {
            tracing::warn!(column = %meta.name, "column already exists");
            return Ok(());
        }
        columns.insert(
            meta.name.clone(),
            Arc::new(ColumnReader::empty_shadow(meta, self.concurrency)),
        );
        tracing::info!(
            collection = %self.collection_name,
            column = %meta.name,
            "added shadow column to persist segment"
        );
        Ok(())
    }

    fn remove_column(&self, column_name: &str) -> Result<()> {
        self.columns.write().remove(column_name);
        Ok(())
    }
}

/// Loaded persist segments of one collection, keyed by segment id.
pub struct PersistSegmentManager {
    segments: RwLock<HashMap<SegmentId, Arc<PersistSegment>>>,
}

impl PersistSegmentManager {
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_segment(&self, segment: Arc<PersistSegment>) {
        self.segments.write().insert(segment.segment_id(), segment);
    }

    pub fn get_segment(&self, segment_id: SegmentId) -> Option<Arc<PersistSegment>> {
        self.segments.read().get(&segment_id).cloned()
    }

    pub fn has_segment(&self, segment_id: SegmentId) -> bool {
        self.segments.read().contains_key(&segment_id)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn unload_segments(&self) {
        self.segments.write().clear();
    }
}

impl Default for PersistSegmentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DataType;
    use crate::segment::{MemorySegment, SegmentState};
    use crate::types::{ColumnData, OperationType, Record};
    use tempfile::TempDir;

    fn encode_fp32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_dump_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let options = ReadOptions {
            use_mmap: true,
            create_new: true,
        };
        let id_map = Arc::new(IdMap::open(dir.path(), options).unwrap());
        let delete_store = Arc::new(DeleteStore::open(dir.path(), options).unwrap());

        let mut schema = CollectionMeta::new("test");
        schema
            .index_columns
            .push(ColumnMeta::new("face", DataType::VectorFp32, 4));

        let mut meta = SegmentMeta::new(0);
        meta.min_doc_id = 0;
        meta.set_state(SegmentState::Writing);

        let memory = MemorySegment::open(
            "test",
            dir.path(),
            meta,
            &schema,
            delete_store.clone(),
            id_map.clone(),
            1,
            options,
        )
        .unwrap();

        for pk in 0..40u64 {
            let record = Record {
                operation_type: OperationType::Insert,
                primary_key: pk,
                revision: 2,
                lsn: pk,
                timestamp: pk,
                forward_data: format!("fw{pk}").into_bytes(),
                column_datas: vec![ColumnData {
                    column_name: "face".to_string(),
                    data_type: DataType::VectorFp32,
                    dimension: 4,
                    data: encode_fp32(&[pk as f32, 0.0, 0.0, 0.0]),
                }],
                ..Default::default()
            };
            let doc_id = memory.insert(&record).unwrap();
            id_map.insert(pk, doc_id).unwrap();
        }
        memory.dump().unwrap();
        let dumped_meta = memory.segment_meta();

        let persist = PersistSegment::load(
            "test",
            dir.path(),
            dumped_meta,
            &schema,
            delete_store,
            id_map,
            1,
            ReadOptions {
                use_mmap: true,
                create_new: false,
            },
        )
        .unwrap();
        assert_eq!(persist.doc_count(), 40);
        assert!(persist.index_version().starts_with("vicinity"));

        let params = QueryParams {
            topk: 3,
            data_type: DataType::VectorFp32,
            dimension: 4,
            ..Default::default()
        };
        let results = persist
            .knn_search("face", &encode_fp32(&[25.0, 0.0, 0.0, 0.0]), &params)
            .unwrap();
        assert_eq!(results[0].primary_key, 25);
        assert_eq!(results[0].forward_data, b"fw25");

        let kv = persist.kv_search(18).unwrap();
        assert_eq!(kv.primary_key, 18);
        assert_eq!(kv.revision, 2);

        let manager = PersistSegmentManager::new();
        manager.add_segment(Arc::new(persist));
        assert!(manager.has_segment(0));
        assert_eq!(manager.segment_count(), 1);
        manager.unload_segments();
        assert!(!manager.has_segment(0));
    }
}
