//! The collection: top-level orchestrator of the LSM-style segment
//! lifecycle, write routing, query fan-out and recovery.

use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::executor::TaskScheduler;
use crate::meta::{CollectionMeta, ColumnMeta};
use crate::segment::{
    MemorySegment, PersistSegment, PersistSegmentManager, Segment, SegmentMeta, SegmentState,
};
use crate::storage::FileId;
use crate::store::{DeleteStore, IdMap, LsnStore};
use crate::types::{
    OperationType, QueryParams, QueryResult, ReadOptions, Record, DOC_ID_INCREASE_COUNT,
    INVALID_DOC_ID, INVALID_KEY,
};
use crate::version::{CollectionSummary, VersionEdit, VersionManager};

const DUMP_RETRY_COUNT: u32 = 3;
const APPLY_RETRY_COUNT: u32 = 3;
/// Scheduler queue reserved for background dumps.
const DUMP_QUEUE: usize = 0;

/// Aggregated statistics over all segments and global stores.
#[derive(Debug, Clone, Default)]
pub struct CollectionStats {
    pub collection_name: String,
    pub collection_path: String,
    pub total_doc_count: u64,
    pub delete_doc_count: u64,
    pub total_segment_count: u64,
    pub total_index_file_count: u64,
    pub total_index_file_size: u64,
    pub segment_stats: Vec<SegmentMeta>,
}

/// One named dataset under one directory.
pub struct Collection {
    /// Handle to the owning `Arc`, used to schedule background work.
    self_ref: Weak<Collection>,
    collection_name: String,
    dir_path: PathBuf,
    schema: RwLock<Arc<CollectionMeta>>,
    concurrency: usize,
    scheduler: Arc<TaskScheduler>,

    version_manager: Arc<VersionManager>,
    id_map: Arc<IdMap>,
    delete_store: Arc<DeleteStore>,
    lsn_store: Arc<LsnStore>,
    writing_segment: ArcSwap<MemorySegment>,
    dumping_segment: ArcSwapOption<MemorySegment>,
    persist_segments: Arc<PersistSegmentManager>,

    schema_mutex: Mutex<()>,
    is_dumping: AtomicBool,
    is_flushing: AtomicBool,
    is_optimizing: AtomicBool,
    opened: AtomicBool,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("collection_name", &self.collection_name)
            .field("dir_path", &self.dir_path)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Opens (or creates) the collection under `<prefix_path>/<name>`,
    /// recovering all lower components from their snapshots.
    pub fn open(
        collection_name: &str,
        prefix_path: &Path,
        schema: CollectionMeta,
        concurrency: usize,
        scheduler: Arc<TaskScheduler>,
        read_options: ReadOptions,
    ) -> Result<Arc<Collection>> {
        let dir_path = prefix_path.join(collection_name);
        let manifest_path = FileId::Manifest.file_path(&dir_path);

        if read_options.create_new {
            if dir_path.exists() {
                tracing::error!(dir = %dir_path.display(), "index directory already exists");
                return Err(Error::DuplicateCollection(collection_name.to_string()));
            }
            std::fs::create_dir_all(&dir_path)?;
        } else if !dir_path.exists() || !manifest_path.exists() {
            tracing::error!(dir = %dir_path.display(), "index directory or manifest missing");
            return Err(Error::InvalidIndexDataFormat(format!(
                "collection {collection_name} has no manifest"
            )));
        }

        match Self::recover_from_snapshot(
            collection_name,
            &dir_path,
            schema,
            concurrency,
            scheduler,
            read_options,
        ) {
            Ok(collection) => {
                let stats = collection.get_stats();
                tracing::info!(
                    collection = collection_name,
                    doc_count = stats.total_doc_count,
                    segment_count = stats.total_segment_count,
                    "opened collection"
                );
                Ok(collection)
            }
            Err(error) => {
                tracing::error!(collection = collection_name, %error, "recover from snapshot failed");
                if read_options.create_new {
                    let _ = std::fs::remove_dir_all(&dir_path);
                }
                Err(error)
            }
        }
    }

    fn recover_from_snapshot(
        collection_name: &str,
        dir_path: &Path,
        schema: CollectionMeta,
        concurrency: usize,
        scheduler: Arc<TaskScheduler>,
        read_options: ReadOptions,
    ) -> Result<Arc<Collection>> {
        let version_manager =
            Arc::new(VersionManager::open(collection_name, dir_path, read_options)?);
        let id_map = Arc::new(IdMap::open(dir_path, read_options)?);
        let delete_store = Arc::new(DeleteStore::open(dir_path, read_options)?);
        let lsn_store = Arc::new(LsnStore::open(dir_path, read_options)?);

        let writing_metas = version_manager.get_segment_metas(SegmentState::Writing)?;
        let dumping_metas = version_manager.get_segment_metas(SegmentState::Dumping)?;
        if writing_metas.len() > 1 {
            return Err(Error::InvalidIndexDataFormat(format!(
                "{} writing segments in manifest",
                writing_metas.len()
            )));
        }
        if dumping_metas.len() > 1 {
            return Err(Error::InvalidIndexDataFormat(format!(
                "{} dumping segments in manifest",
                dumping_metas.len()
            )));
        }
        let writing_meta = match writing_metas.first() {
            Some(meta) => *meta,
            None => {
                // A crash between the two rotation manifest writes leaves
                // the old segment DUMPING and the new one still CREATED;
                // redo the missing write. The new segment's files were
                // created and flushed before either manifest write.
                let dumping = dumping_metas.first().ok_or_else(|| {
                    Error::InvalidIndexDataFormat("no writing segment".to_string())
                })?;
                let mut meta = version_manager.alloc_segment_meta()?;
                meta.min_doc_id = dumping.max_doc_id + DOC_ID_INCREASE_COUNT;
                meta.max_doc_id = meta.min_doc_id;
                meta.set_state(SegmentState::Writing);
                version_manager.update_segment_meta(&meta)?;
                tracing::warn!(
                    collection = collection_name,
                    segment = meta.segment_id,
                    "repaired interrupted segment rotation"
                );
                meta
            }
        };
        let writing_segment = Arc::new(MemorySegment::open(
            collection_name,
            dir_path,
            writing_meta,
            &schema,
            delete_store.clone(),
            id_map.clone(),
            concurrency,
            read_options,
        )?);

        let dumping_segment = match dumping_metas.first() {
            Some(meta) => Some(Arc::new(MemorySegment::open(
                collection_name,
                dir_path,
                *meta,
                &schema,
                delete_store.clone(),
                id_map.clone(),
                concurrency,
                ReadOptions {
                    use_mmap: read_options.use_mmap,
                    create_new: false,
                },
            )?)),
            None => None,
        };

        let collection = Arc::new_cyclic(|self_ref| Collection {
            self_ref: self_ref.clone(),
            collection_name: collection_name.to_string(),
            dir_path: dir_path.to_path_buf(),
            schema: RwLock::new(Arc::new(schema)),
            concurrency,
            scheduler,
            version_manager,
            id_map,
            delete_store,
            lsn_store,
            writing_segment: ArcSwap::from(writing_segment),
            dumping_segment: ArcSwapOption::from(dumping_segment.clone()),
            persist_segments: Arc::new(PersistSegmentManager::new()),
            schema_mutex: Mutex::new(()),
            is_dumping: AtomicBool::new(false),
            is_flushing: AtomicBool::new(false),
            is_optimizing: AtomicBool::new(false),
            opened: AtomicBool::new(true),
        });

        // Load the live persist set.
        for meta in collection.version_manager.current_version() {
            let segment = collection.load_persist_segment(&meta)?;
            collection.persist_segments.add_segment(segment);
        }

        // An interrupted dump resumes where the crash left it.
        if dumping_segment.is_some() {
            collection.is_dumping.store(true, Ordering::Release);
            let background = collection.clone();
            collection
                .scheduler
                .submit(DUMP_QUEUE, move || background.do_dump_segment());
        }

        // A fresh collection flushes once so its files are well-formed
        // containers from the start.
        if read_options.create_new {
            collection.flush()?;
        }

        Ok(collection)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    pub fn schema(&self) -> Arc<CollectionMeta> {
        self.schema.read().clone()
    }

    fn check_opened(&self) -> Result<()> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(Error::Status("collection not opened".to_string()));
        }
        Ok(())
    }

    /// Routes a batch of writes, attempting every row; the last failure is
    /// returned after the batch completes.
    pub fn write_records(&self, records: &[Record]) -> Result<()> {
        self.check_opened()?;

        let mut failure = None;
        for record in records {
            let outcome = match record.operation_type {
                OperationType::Insert => self.insert_record(record),
                OperationType::Update => self.update_record(record),
                OperationType::Delete => self.delete_record(record.primary_key),
            };
            if let Err(error) = outcome {
                tracing::error!(
                    collection = %self.collection_name,
                    key = record.primary_key,
                    lsn = record.lsn,
                    %error,
                    "write record failed"
                );
                failure = Some(error);
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Inserts one record, rotating the writing segment at the doc cap.
    pub fn insert_record(&self, record: &Record) -> Result<()> {
        self.check_opened()?;
        if record.primary_key == INVALID_KEY {
            return Err(Error::InvalidRecord("reserved primary key".to_string()));
        }
        if self.id_map.has(record.primary_key) {
            return Err(Error::DuplicateKey(record.primary_key));
        }

        let writing = self.writing_segment.load_full();
        let doc_id = writing.insert(record)?;
        self.id_map.insert(record.primary_key, doc_id)?;

        // The LSN log serves recovery only; losing one entry is harmless.
        if let Err(error) = self.lsn_store.append(record.lsn, &record.lsn_context) {
            tracing::warn!(
                collection = %self.collection_name,
                key = record.primary_key,
                %error,
                "lsn append failed"
            );
        }

        let cap = self.schema.read().max_docs_per_segment;
        if cap > 0 && writing.doc_count() >= cap {
            if let Err(error) = self.drive_dump_segment() {
                tracing::error!(collection = %self.collection_name, %error, "drive dump failed");
            }
        }
        Ok(())
    }

    /// Marks a primary key deleted and unmaps it.
    pub fn delete_record(&self, primary_key: u64) -> Result<()> {
        self.check_opened()?;
        if !self.id_map.has(primary_key) {
            return Err(Error::InexistentKey(primary_key));
        }
        let doc_id = self.id_map.get_mapping_id(primary_key);
        if doc_id == INVALID_DOC_ID {
            return Err(Error::Runtime(format!(
                "mapping for key {primary_key} vanished"
            )));
        }

        self.delete_store.insert(doc_id)?;
        self.id_map.remove(primary_key)?;

        let writing = self.writing_segment.load_full();
        if writing.is_in_range(doc_id) {
            writing.remove(doc_id)?;
        }
        Ok(())
    }

    /// Replaces a record; with `lsn_check` the new LSN must advance.
    pub fn update_record(&self, record: &Record) -> Result<()> {
        self.check_opened()?;
        if !self.id_map.has(record.primary_key) {
            return Err(Error::InexistentKey(record.primary_key));
        }

        if record.lsn_check {
            let old = self.kv_search(record.primary_key)?;
            if old.primary_key != INVALID_KEY && record.lsn <= old.lsn {
                return Err(Error::InvalidRecord(format!(
                    "lsn {} not beyond {}",
                    record.lsn, old.lsn
                )));
            }
        }

        self.delete_record(record.primary_key)?;
        self.insert_record(record)
    }

    pub fn has_record(&self, primary_key: u64) -> bool {
        self.id_map.has(primary_key)
    }

    /// Point lookup routed to the segment owning the key's docId.
    pub fn kv_search(&self, primary_key: u64) -> Result<QueryResult> {
        self.check_opened()?;
        if !self.has_record(primary_key) {
            return Ok(QueryResult::default());
        }
        let doc_id = self.id_map.get_mapping_id(primary_key);

        let mut owner: Option<Arc<dyn Segment>> = None;
        for meta in self.version_manager.current_version().iter().rev() {
            if meta.is_in_range(doc_id) {
                if let Some(segment) = self.persist_segments.get_segment(meta.segment_id) {
                    owner = Some(segment);
                }
                break;
            }
        }
        if owner.is_none() {
            if let Some(dumping) = self.dumping_segment.load_full() {
                if dumping.is_in_range(doc_id) {
                    owner = Some(dumping);
                }
            }
        }
        let owner: Arc<dyn Segment> = match owner {
            Some(owner) => owner,
            None => self.writing_segment.load_full(),
        };
        owner.kv_search(primary_key)
    }

    /// Top-k fan-out across persist, dumping and writing segments, merged
    /// with a bounded heap.
    pub fn knn_search(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
    ) -> Result<Vec<QueryResult>> {
        let mut batches = self.knn_search_batch(column_name, query, params, 1)?;
        Ok(batches.pop().unwrap_or_default())
    }

    /// Batched fan-out: one merged result list per packed query vector.
    pub fn knn_search_batch(
        &self,
        column_name: &str,
        query: &[u8],
        params: &QueryParams,
        batch: u32,
    ) -> Result<Vec<Vec<QueryResult>>> {
        self.check_opened()?;
        let segments = self.get_segments()?;
        let batch = batch.max(1);

        let mut per_segment: Vec<Vec<Vec<QueryResult>>> = Vec::with_capacity(segments.len());
        if self.scheduler.queue_count() > 1 {
            let (tx, rx) = std::sync::mpsc::channel();
            for (slot, segment) in segments.iter().enumerate() {
                let tx = tx.clone();
                let segment = segment.clone();
                let column_name = column_name.to_string();
                let query = query.to_vec();
                let params = params.clone();
                // Dumps own queue 0; searches spread over the rest.
                let queue = 1 + (slot % (self.scheduler.queue_count() - 1));
                self.scheduler.submit(queue, move || {
                    let result = segment.knn_search_batch(&column_name, &query, &params, batch);
                    let _ = tx.send(result);
                });
            }
            drop(tx);
            for result in rx {
                per_segment.push(result?);
            }
        } else {
            for segment in &segments {
                per_segment.push(segment.knn_search_batch(column_name, query, params, batch)?);
            }
        }

        let topk = params.topk as usize;
        let mut merged = Vec::with_capacity(batch as usize);
        for index in 0..batch as usize {
            let lists = per_segment
                .iter_mut()
                .map(|batches| std::mem::take(&mut batches[index]));
            merged.push(merge_topk(lists, topk));
        }
        Ok(merged)
    }

    /// Highest contiguous-prefix LSN, for CDC resume.
    pub fn get_latest_lsn(&self) -> Result<(u64, Vec<u8>)> {
        self.check_opened()?;
        self.lsn_store.get_latest_lsn()
    }

    /// Segments queries must consult: the live persist set, the dumping
    /// segment while it is not yet published, and the writing segment.
    pub fn get_segments(&self) -> Result<Vec<Arc<dyn Segment>>> {
        self.check_opened()?;
        let mut segments: Vec<Arc<dyn Segment>> = Vec::new();

        for meta in self.version_manager.current_version() {
            match self.persist_segments.get_segment(meta.segment_id) {
                Some(segment) => segments.push(segment),
                None => {
                    // Pre-load may have failed; try again on demand.
                    let segment = self.load_persist_segment(&meta)?;
                    self.persist_segments.add_segment(segment.clone());
                    segments.push(segment);
                }
            }
        }

        if let Some(dumping) = self.dumping_segment.load_full() {
            if !self.persist_segments.has_segment(dumping.segment_id()) {
                segments.push(dumping);
            }
        }
        segments.push(self.writing_segment.load_full());
        Ok(segments)
    }

    pub fn get_stats(&self) -> CollectionStats {
        let mut stats = CollectionStats {
            collection_name: self.collection_name.clone(),
            collection_path: self.dir_path.display().to_string(),
            delete_doc_count: self.delete_store.count(),
            ..Default::default()
        };

        for meta in self.version_manager.current_version() {
            stats.total_doc_count += meta.doc_count;
            stats.total_index_file_count += meta.index_file_count;
            stats.total_index_file_size += meta.index_file_size;
            stats.total_segment_count += 1;
            stats.segment_stats.push(meta);
        }
        if let Some(dumping) = self.dumping_segment.load_full() {
            if !self.persist_segments.has_segment(dumping.segment_id()) {
                let meta = dumping.segment_meta();
                stats.total_doc_count += meta.doc_count;
                stats.total_index_file_count += meta.index_file_count;
                stats.total_index_file_size += meta.index_file_size;
                stats.total_segment_count += 1;
                stats.segment_stats.push(meta);
            }
        }
        let writing = self.writing_segment.load_full();
        let meta = writing.segment_meta();
        stats.total_doc_count += meta.doc_count;
        stats.total_index_file_count += meta.index_file_count;
        stats.total_index_file_size += meta.index_file_size;
        stats.total_segment_count += 1;
        stats.segment_stats.push(meta);

        stats.total_index_file_count += 4;
        stats.total_index_file_size += self.id_map.file_size()
            + self.delete_store.file_size()
            + self.lsn_store.file_size()
            + self.version_manager.file_size();
        stats
    }

    /// Forces a segment rotation and background dump.
    pub fn dump(&self) -> Result<()> {
        self.check_opened()?;
        self.drive_dump_segment()
    }

    /// Flushes every store and mirrors the writing segment meta into the
    /// manifest; this is the crash-recovery boundary.
    pub fn flush(&self) -> Result<()> {
        self.check_opened()?;
        if self.is_flushing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.flush_inner();
        self.is_flushing.store(false, Ordering::Release);
        result
    }

    fn flush_inner(&self) -> Result<()> {
        tracing::info!(collection = %self.collection_name, "flushing collection");
        let writing = self.writing_segment.load_full();
        writing.flush()?;
        self.id_map.flush()?;
        self.delete_store.flush()?;
        self.lsn_store.flush()?;

        self.version_manager.update_segment_meta(&writing.segment_meta())?;
        let mut summary = CollectionSummary {
            schema_revision: self.schema.read().revision as u64,
            total_doc_count: 0,
            delete_doc_count: self.delete_store.count(),
            reserved: [0; 5],
        };
        summary.total_doc_count = self.get_stats().total_doc_count;
        self.version_manager.update_collection_summary(&summary)?;
        self.version_manager.flush()
    }

    /// Drives the writing segment's engine optimization.
    pub fn optimize(&self) -> Result<()> {
        self.check_opened()?;
        if self.is_optimizing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.writing_segment.load_full().optimize();
        self.is_optimizing.store(false, Ordering::Release);
        result
    }

    /// Waits for background work, then closes every component.
    pub fn close(&self) -> Result<()> {
        self.check_opened()?;

        while self.is_dumping.load(Ordering::Acquire) {
            tracing::info!(collection = %self.collection_name, "waiting for dump before close");
            std::thread::sleep(Duration::from_secs(1));
        }
        while self.is_flushing.load(Ordering::Acquire) {
            tracing::info!(collection = %self.collection_name, "waiting for flush before close");
            std::thread::sleep(Duration::from_secs(1));
        }
        while self.is_optimizing.load(Ordering::Acquire) {
            tracing::info!(collection = %self.collection_name, "waiting for optimize before close");
            std::thread::sleep(Duration::from_secs(1));
        }

        self.writing_segment.load_full().close()?;
        // A failed dump may leave the dumping segment behind; close it too.
        if let Some(dumping) = self.dumping_segment.swap(None) {
            dumping.close()?;
        }
        self.persist_segments.unload_segments();

        self.id_map.close()?;
        self.delete_store.close()?;
        self.lsn_store.close()?;
        self.version_manager.close()?;

        self.opened.store(false, Ordering::Release);
        tracing::info!(collection = %self.collection_name, "closed collection");
        Ok(())
    }

    /// Close, then delete the collection directory.
    pub fn close_and_cleanup(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.dir_path)?;
        Ok(())
    }

    /// Replaces the schema, applying index-column adds and removals to
    /// every segment. Revisions must advance.
    pub fn update_schema(&self, new_schema: CollectionMeta) -> Result<()> {
        self.check_opened()?;
        let _lock = self.schema_mutex.lock();
        if self.is_dumping.load(Ordering::Acquire) {
            tracing::error!(collection = %self.collection_name, "schema update while dumping");
            return Err(Error::Status("collection is dumping".to_string()));
        }

        let current = self.schema.read().clone();
        if new_schema.revision <= current.revision {
            return Err(Error::MismatchedSchema(format!(
                "revision {} not beyond {}",
                new_schema.revision, current.revision
            )));
        }

        let (added, removed) = current.diff_columns(&new_schema)?;
        let added: Vec<ColumnMeta> = added.into_iter().cloned().collect();
        let removed: Vec<ColumnMeta> = removed.into_iter().cloned().collect();

        let segments = self.get_segments()?;
        for column in &added {
            for segment in &segments {
                segment.add_column(column)?;
            }
        }
        for column in &removed {
            for segment in &segments {
                segment.remove_column(&column.name)?;
            }
        }

        let old_revision = current.revision;
        *self.schema.write() = Arc::new(new_schema);
        tracing::info!(
            collection = %self.collection_name,
            old_revision,
            new_revision = self.schema.read().revision,
            "updated schema"
        );
        Ok(())
    }

    /// Rotates the writing segment and schedules the background dump. Holds
    /// the schema mutex so a rotation cannot interleave with a schema
    /// update.
    fn drive_dump_segment(&self) -> Result<()> {
        let _schema_lock = self.schema_mutex.lock();
        if self.is_dumping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let background = match self.self_ref.upgrade() {
            Some(background) => background,
            None => {
                self.is_dumping.store(false, Ordering::Release);
                return Err(Error::Status("collection is shutting down".to_string()));
            }
        };

        let result = self.rotate_writing_segment();
        match result {
            Ok(()) => {
                self.scheduler
                    .submit(DUMP_QUEUE, move || background.do_dump_segment());
                Ok(())
            }
            Err(error) => {
                self.is_dumping.store(false, Ordering::Release);
                Err(error)
            }
        }
    }

    fn rotate_writing_segment(&self) -> Result<()> {
        let mut new_meta = self.version_manager.alloc_segment_meta()?;
        let writing = self.writing_segment.load_full();
        new_meta.min_doc_id = writing.segment_meta().max_doc_id + DOC_ID_INCREASE_COUNT;
        new_meta.max_doc_id = new_meta.min_doc_id;

        let schema = self.schema.read().clone();
        let new_segment = Arc::new(MemorySegment::open(
            &self.collection_name,
            &self.dir_path,
            new_meta,
            &schema,
            self.delete_store.clone(),
            self.id_map.clone(),
            self.concurrency,
            ReadOptions {
                use_mmap: true,
                create_new: true,
            },
        )?);
        new_segment.update_state(SegmentState::Writing);
        new_segment.flush()?;

        let old_writing = self.writing_segment.swap(new_segment.clone());
        self.dumping_segment.store(Some(old_writing.clone()));

        // Persist the old segment's state first: the manifest must never
        // hold two WRITING metas. A crash before the second write leaves
        // zero WRITING metas, which recovery repairs from the DUMPING one.
        old_writing.flush()?;
        old_writing.update_state(SegmentState::Dumping);
        self.version_manager
            .update_segment_meta(&old_writing.segment_meta())?;

        self.version_manager
            .update_segment_meta(&new_segment.segment_meta())?;
        Ok(())
    }

    /// Background half of the rotation: dump, publish, pre-load, release.
    fn do_dump_segment(&self) {
        let dumping = match self.dumping_segment.load_full() {
            Some(dumping) => dumping,
            None => {
                self.is_dumping.store(false, Ordering::Release);
                return;
            }
        };
        let segment_id = dumping.segment_id();
        tracing::info!(collection = %self.collection_name, segment = segment_id, "dumping segment");

        let mut dumped = false;
        for retry in 0..DUMP_RETRY_COUNT {
            match dumping.dump() {
                Ok(()) => {
                    dumped = true;
                    break;
                }
                Err(error) => {
                    tracing::error!(
                        collection = %self.collection_name,
                        segment = segment_id,
                        retry,
                        %error,
                        "dump segment failed"
                    );
                }
            }
        }
        if !dumped {
            self.is_dumping.store(false, Ordering::Release);
            return;
        }

        dumping.update_state(SegmentState::Persist);
        if let Err(error) = self
            .version_manager
            .update_segment_meta(&dumping.segment_meta())
        {
            tracing::error!(collection = %self.collection_name, %error, "update segment meta failed");
            self.is_dumping.store(false, Ordering::Release);
            return;
        }

        let edit = VersionEdit {
            add_segments: vec![segment_id],
            ..Default::default()
        };
        let mut applied = false;
        for retry in 0..APPLY_RETRY_COUNT {
            match self.version_manager.apply(&edit) {
                Ok(()) => {
                    applied = true;
                    break;
                }
                Err(error) => {
                    tracing::error!(
                        collection = %self.collection_name,
                        retry,
                        %error,
                        "apply version edit failed"
                    );
                }
            }
        }
        if !applied {
            self.is_dumping.store(false, Ordering::Release);
            return;
        }

        // Pre-load a reader so queries stop consulting the memory copy.
        match self.load_persist_segment(&dumping.segment_meta()) {
            Ok(segment) => self.persist_segments.add_segment(segment),
            Err(error) => {
                tracing::warn!(
                    collection = %self.collection_name,
                    segment = segment_id,
                    %error,
                    "pre-load persist segment failed"
                );
            }
        }

        // Drop our handle; the segment removes its memory-side files once
        // in-flight searches release theirs.
        self.dumping_segment.store(None);

        if let Err(error) = self.lsn_store.shift() {
            tracing::warn!(collection = %self.collection_name, %error, "lsn shift failed");
        }

        self.is_dumping.store(false, Ordering::Release);
        tracing::info!(collection = %self.collection_name, segment = segment_id, "dump finished");
    }

    fn load_persist_segment(&self, meta: &SegmentMeta) -> Result<Arc<PersistSegment>> {
        let schema = self.schema.read().clone();
        Ok(Arc::new(PersistSegment::load(
            &self.collection_name,
            &self.dir_path,
            *meta,
            &schema,
            self.delete_store.clone(),
            self.id_map.clone(),
            self.concurrency,
            ReadOptions {
                use_mmap: true,
                create_new: false,
            },
        )?))
    }

    /// Whether a background dump is in flight.
    pub fn is_dumping(&self) -> bool {
        self.is_dumping.load(Ordering::Acquire)
    }

    /// Metas of the segments in the current live version.
    pub fn current_version(&self) -> Vec<SegmentMeta> {
        self.version_manager.current_version()
    }
}

struct HeapEntry(QueryResult);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// The heap keeps its worst entry on top so overflow pops it.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0.is_better_than(&other.0) {
            std::cmp::Ordering::Less
        } else if other.0.is_better_than(&self.0) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    }
}

/// Merges per-segment result lists into the best `topk`.
fn merge_topk(
    lists: impl Iterator<Item = Vec<QueryResult>>,
    topk: usize,
) -> Vec<QueryResult> {
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(topk + 1);
    for list in lists {
        for result in list {
            heap.push(HeapEntry(result));
            if heap.len() > topk {
                heap.pop();
            }
        }
    }
    let mut merged: Vec<QueryResult> = heap.into_iter().map(|entry| entry.0).collect();
    merged.sort_by(|a, b| {
        if a.is_better_than(b) {
            std::cmp::Ordering::Less
        } else if b.is_better_than(a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    merged
}
