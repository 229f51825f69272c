//! The writable memory segment: a forward indexer plus one column indexer
//! per schema column, all backed by per-segment snapshot files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::column::{ColumnIndexer, ForwardData, ForwardIndexer};
use crate::error::{Error, Result};
use crate::format::Packer;
use crate::meta::{CollectionMeta, ColumnMeta};
use crate::storage::FileId;
use crate::store::{DeleteStore, IdMap};
use crate::types::{
    DocId, QueryParams, QueryResult, ReadOptions, Record, SegmentId, INVALID_KEY,
};

use super::{fill_results, ActiveGuard, Segment, SegmentMeta, SegmentState};

const MAX_WAIT_RETRY: u32 = 60;

pub struct MemorySegment {
    collection_name: String,
    collection_path: PathBuf,
    meta: Mutex<SegmentMeta>,
    forward: ForwardIndexer,
    columns: RwLock<HashMap<String, Arc<ColumnIndexer>>>,
    delete_store: Arc<DeleteStore>,
    id_map: Arc<IdMap>,
    concurrency: usize,
    active_insert_count: AtomicU64,
    active_search_count: AtomicU64,
    closed: AtomicBool,
}

impl MemorySegment {
    /// Opens the segment's forward and column stores under the collection
    /// directory.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        collection_name: &str,
        collection_path: &Path,
        segment_meta: SegmentMeta,
        schema: &CollectionMeta,
        delete_store: Arc<DeleteStore>,
        id_map: Arc<IdMap>,
        concurrency: usize,
        options: ReadOptions,
    ) -> Result<MemorySegment> {
        let forward = ForwardIndexer::open(
            collection_path,
            segment_meta.segment_id,
            segment_meta.min_doc_id,
            options,
        )?;

        let mut columns = HashMap::new();
        for column_meta in &schema.index_columns {
            let indexer = ColumnIndexer::open(
                collection_path,
                segment_meta.segment_id,
                column_meta,
                concurrency,
                options,
            )?;
            columns.insert(column_meta.name.clone(), Arc::new(indexer));
        }

        let segment = MemorySegment {
            collection_name: collection_name.to_string(),
            collection_path: collection_path.to_path_buf(),
            meta: Mutex::new(segment_meta),
            forward,
            columns: RwLock::new(columns),
            delete_store,
            id_map,
            concurrency,
            active_insert_count: AtomicU64::new(0),
            active_search_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        segment.refresh_file_stats();

        tracing::info!(
            collection = %segment.collection_name,
            segment = segment_meta.segment_id,
            min_doc_id = segment_meta.min_doc_id,
            "opened memory segment"
        );
        Ok(segment)
    }

    /// Inserts one record: forward first (allocating the docId), then every
    /// column it carries.
    pub fn insert(&self, record: &Record) -> Result<DocId> {
        let _guard = ActiveGuard::new(&self.active_insert_count);

        let mut forward = ForwardData::default();
        forward.header.primary_key = record.primary_key;
        forward.header.timestamp = record.timestamp;
        forward.header.revision = record.revision;
        forward.header.lsn = record.lsn;
        forward.data = record.forward_data.clone();
        let doc_id = self.forward.insert(&forward)?;

        let columns = self.columns.read();
        for column_data in &record.column_datas {
            let indexer = match columns.get(&column_data.column_name) {
                Some(indexer) => indexer,
                None => {
                    tracing::error!(
                        collection = %self.collection_name,
                        column = %column_data.column_name,
                        "no indexer for record column"
                    );
                    continue;
                }
            };
            indexer.insert(doc_id, column_data)?;
        }
        drop(columns);

        self.update_stats(record, doc_id);
        Ok(doc_id)
    }

    /// Removes a doc from every column engine that supports it.
    pub fn remove(&self, doc_id: DocId) -> Result<()> {
        let columns = self.columns.read();
        for indexer in columns.values() {
            if let Err(error) = indexer.remove(doc_id) {
                tracing::warn!(
                    collection = %self.collection_name,
                    column = indexer.column_name(),
                    doc_id,
                    %error,
                    "column remove failed"
                );
            }
        }
        Ok(())
    }

    /// Drives every column's engine optimization.
    pub fn optimize(&self) -> Result<()> {
        let columns = self.columns.read();
        for indexer in columns.values() {
            if let Err(error) = indexer.optimize() {
                tracing::warn!(
                    collection = %self.collection_name,
                    column = indexer.column_name(),
                    %error,
                    "column optimize failed"
                );
            }
        }
        Ok(())
    }

    /// Packs forward plus all columns into `data.seg.<id>`.
    pub fn dump(&self) -> Result<()> {
        self.wait_for_drain(false);

        let path = FileId::Segment.segment_file_path(&self.collection_path, self.segment_id());
        let file = std::fs::File::create(&path)
            .map_err(|e| Error::WriteData(format!("create segment file: {e}")))?;
        let mut packer = Packer::new(std::io::BufWriter::new(file));
        packer.setup()?;

        self.forward.dump(&mut packer)?;
        let columns = self.columns.read();
        for indexer in columns.values() {
            indexer.dump(&mut packer)?;
        }
        drop(columns);
        packer.finish(0)?;

        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mut meta = self.meta.lock();
        meta.index_file_count = 1;
        meta.index_file_size = file_size;
        tracing::info!(
            collection = %self.collection_name,
            segment = meta.segment_id,
            file_size,
            "dumped memory segment"
        );
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.forward.flush()?;
        let columns = self.columns.read();
        for indexer in columns.values() {
            indexer.flush()?;
        }
        drop(columns);
        self.refresh_file_stats();
        Ok(())
    }

    /// Waits for in-flight operations, then closes all stores.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.wait_for_drain(true);
        self.forward.close()?;
        let mut columns = self.columns.write();
        for indexer in columns.values() {
            indexer.close()?;
        }
        columns.clear();
        tracing::debug!(collection = %self.collection_name, "closed memory segment");
        Ok(())
    }

    /// Close and delete the per-segment snapshot files; used once the
    /// segment has become persist.
    pub fn close_and_remove_files(&self) -> Result<()> {
        let mut paths = vec![self.forward.file_path().to_path_buf()];
        {
            let columns = self.columns.read();
            paths.extend(columns.values().map(|c| c.file_path().to_path_buf()));
        }
        self.close()?;
        for path in paths {
            if let Err(error) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "remove segment file failed");
            }
        }
        Ok(())
    }

    pub fn update_state(&self, state: SegmentState) {
        self.meta.lock().set_state(state);
    }

    pub fn state(&self) -> SegmentState {
        self.meta.lock().segment_state()
    }

    pub fn min_doc_id(&self) -> DocId {
        self.meta.lock().min_doc_id
    }

    fn wait_for_drain(&self, include_searches: bool) {
        let mut retry = 0;
        loop {
            let inserts = self.active_insert_count.load(Ordering::Acquire);
            let searches = if include_searches {
                self.active_search_count.load(Ordering::Acquire)
            } else {
                0
            };
            if inserts == 0 && searches == 0 {
                break;
            }
            if retry >= MAX_WAIT_RETRY {
                tracing::warn!(
                    collection = %self.collection_name,
                    inserts,
                    searches,
                    "proceeding with active operations"
                );
                break;
            }
            tracing::info!(
                collection = %self.collection_name,
                inserts,
                searches,
                retry,
                "waiting for active operations"
            );
            std::thread::sleep(Duration::from_secs(1));
            retry += 1;
        }
    }

    fn update_stats(&self, record: &Record, doc_id: DocId) {
        let mut meta = self.meta.lock();
        meta.doc_count += 1;
        if doc_id > meta.max_doc_id {
            meta.max_doc_id = doc_id;
        }
        if record.primary_key < meta.min_primary_key {
            meta.min_primary_key = record.primary_key;
        }
        if record.primary_key > meta.max_primary_key {
            meta.max_primary_key = record.primary_key;
        }
        if record.timestamp < meta.min_timestamp {
            meta.min_timestamp = record.timestamp;
        }
        if record.timestamp > meta.max_timestamp {
            meta.max_timestamp = record.timestamp;
        }
        if record.lsn < meta.min_lsn {
            meta.min_lsn = record.lsn;
        }
        if record.lsn > meta.max_lsn {
            meta.max_lsn = record.lsn;
        }
    }

    fn refresh_file_stats(&self) {
        let columns = self.columns.read();
        let mut size = self.forward.file_size();
        for indexer in columns.values() {
            size += indexer.file_size();
        }
        let mut meta = self.meta.lock();
        meta.index_file_count = columns.len() as u64 + 1;
        meta.index_file_size = size;
    }
}

impl Drop for MemorySegment {
    /// A segment that became persist removes its memory-side files once the
    /// last reference (including in-flight searches) lets go.
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let result = if self.state() == SegmentState::Persist {
            self.close_and_remove_files()
        } else {
            self.close()
        };
        if let Err(error) = result {
            tracing::warn!(collection = %self.collection_name, %error, "segment drop cleanup failed");
        }
    }
}

impl Segment for MemorySegment {
    fn segment_id(&self) -> SegmentId {
        self.meta.lock().segment_id
    }

    fn segment_meta(&self) -> SegmentMeta {
        *self.meta.lock()
    }

    fn doc_count(&self) -> u64 {
        self.meta.lock().doc_count
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
        let _guard = ActiveGuard::new(&self.active_search_count);

        let indexer = {
            let columns = self.columns.read();
            columns
                .get(column_name)
                .cloned()
                .ok_or_else(|| Error::InexistentColumn(column_name.to_string()))?
        };

        let delete_store = self.delete_store.clone();
        let filter = move |doc_id: DocId| delete_store.has(doc_id);
        let filter_ref: Option<&(dyn Fn(DocId) -> bool + Sync)> =
            if self.delete_store.count() > 0 {
                Some(&filter)
            } else {
                None
            };

        let batches = indexer.search_batch(query, params, batch, filter_ref)?;
        let reverse = indexer.reverse_sort();
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

    /// Physically creates a new column indexer file.
    fn add_column(&self, meta: &ColumnMeta) -> Result<()> {
        let mut columns = self.columns.write();
        if columns.contains_key(&meta.name) {
            tracing::warn!(column = %meta.name, "column already exists");
            return Ok(());
        }
        let indexer = ColumnIndexer::open(
            &self.collection_path,
            self.segment_id(),
            meta,
            self.concurrency,
            ReadOptions {
                use_mmap: true,
                create_new: true,
            },
        )?;
        columns.insert(meta.name.clone(), Arc::new(indexer));
        tracing::info!(collection = %self.collection_name, column = %meta.name, "added column");
        Ok(())
    }

    /// Closes and deletes the column's snapshot file.
    fn remove_column(&self, column_name: &str) -> Result<()> {
        let mut columns = self.columns.write();
        let indexer = match columns.remove(column_name) {
            Some(indexer) => indexer,
            None => {
                tracing::warn!(column = column_name, "column does not exist");
                return Ok(());
            }
        };
        let path = indexer.file_path().to_path_buf();
        indexer.close()?;
        if let Err(error) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), %error, "remove column file failed");
        }
        tracing::info!(collection = %self.collection_name, column = column_name, "removed column");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DataType;
    use crate::types::{ColumnData, OperationType};
    use tempfile::TempDir;

    fn encode_fp32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    struct Fixture {
        _dir: TempDir,
        segment: MemorySegment,
        id_map: Arc<IdMap>,
        delete_store: Arc<DeleteStore>,
    }

    fn make_fixture(min_doc_id: DocId) -> Fixture {
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
        meta.min_doc_id = min_doc_id;
        meta.max_doc_id = min_doc_id;
        meta.set_state(SegmentState::Writing);

        let segment = MemorySegment::open(
            "test",
            dir.path(),
            meta,
            &schema,
            delete_store.clone(),
            id_map.clone(),
            2,
            options,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            segment,
            id_map,
            delete_store,
        }
    }

    fn make_record(pk: u64, vector: &[f32]) -> Record {
        Record {
            operation_type: OperationType::Insert,
            primary_key: pk,
            revision: 1,
            lsn: pk,
            timestamp: pk * 100,
            forward_data: format!("payload{pk}").into_bytes(),
            column_datas: vec![ColumnData {
                column_name: "face".to_string(),
                data_type: DataType::VectorFp32,
                dimension: 4,
                data: encode_fp32(vector),
            }],
            ..Default::default()
        }
    }

    fn make_params() -> QueryParams {
        QueryParams {
            topk: 5,
            data_type: DataType::VectorFp32,
            dimension: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_assigns_increasing_doc_ids() {
        let fixture = make_fixture(1000);
        let mut last = 0;
        for pk in 0..20u64 {
            let doc_id = fixture
                .segment
                .insert(&make_record(pk, &[pk as f32, 0.0, 0.0, 0.0]))
                .unwrap();
            fixture.id_map.insert(pk, doc_id).unwrap();
            if pk > 0 {
                assert!(doc_id > last);
            }
            last = doc_id;
        }
        assert_eq!(fixture.segment.doc_count(), 20);

        let meta = fixture.segment.segment_meta();
        assert_eq!(meta.min_primary_key, 0);
        assert_eq!(meta.max_primary_key, 19);
        assert_eq!(meta.max_doc_id, 1019);
    }

    #[test]
    fn test_knn_search_fills_forward() {
        let fixture = make_fixture(0);
        for pk in 0..30u64 {
            let doc_id = fixture
                .segment
                .insert(&make_record(pk, &[pk as f32, 0.0, 0.0, 0.0]))
                .unwrap();
            fixture.id_map.insert(pk, doc_id).unwrap();
        }

        let results = fixture
            .segment
            .knn_search("face", &encode_fp32(&[12.0, 0.0, 0.0, 0.0]), &make_params())
            .unwrap();
        assert_eq!(results[0].primary_key, 12);
        assert_eq!(results[0].forward_data, b"payload12");
        assert!(results[0].score.abs() < 1e-6);

        assert!(matches!(
            fixture
                .segment
                .knn_search("ghost", &encode_fp32(&[0.0; 4]), &make_params()),
            Err(Error::InexistentColumn(_))
        ));
    }

    #[test]
    fn test_kv_search_respects_deletes_and_range() {
        let fixture = make_fixture(500);
        let doc_id = fixture
            .segment
            .insert(&make_record(77, &[1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        fixture.id_map.insert(77, doc_id).unwrap();

        let result = fixture.segment.kv_search(77).unwrap();
        assert_eq!(result.primary_key, 77);

        fixture.delete_store.insert(doc_id).unwrap();
        let result = fixture.segment.kv_search(77).unwrap();
        assert_eq!(result.primary_key, INVALID_KEY);

        let result = fixture.segment.kv_search(99).unwrap();
        assert_eq!(result.primary_key, INVALID_KEY);
    }

    #[test]
    fn test_deleted_docs_filtered_from_search() {
        let fixture = make_fixture(0);
        for pk in 0..10u64 {
            let doc_id = fixture
                .segment
                .insert(&make_record(pk, &[pk as f32, 0.0, 0.0, 0.0]))
                .unwrap();
            fixture.id_map.insert(pk, doc_id).unwrap();
        }
        fixture.delete_store.insert(3).unwrap();
        fixture.segment.remove(3).unwrap();

        let results = fixture
            .segment
            .knn_search("face", &encode_fp32(&[3.0, 0.0, 0.0, 0.0]), &make_params())
            .unwrap();
        assert!(results.iter().all(|r| r.primary_key != 3));
    }

    #[test]
    fn test_add_and_remove_column() {
        let fixture = make_fixture(0);
        let extra = ColumnMeta::new("scene", DataType::VectorFp32, 4);
        fixture.segment.add_column(&extra).unwrap();

        let results = fixture
            .segment
            .knn_search("scene", &encode_fp32(&[0.0; 4]), &make_params())
            .unwrap();
        assert!(results.is_empty());

        fixture.segment.remove_column("scene").unwrap();
        assert!(fixture
            .segment
            .knn_search("scene", &encode_fp32(&[0.0; 4]), &make_params())
            .is_err());
    }
}
