//! Writable per-column vector index of a memory segment.

use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::format::Packer;
use crate::meta::ColumnMeta;
use crate::storage::{FileId, Snapshot};
use crate::types::{ColumnData, DocId, QueryParams, ReadOptions, SegmentId};

use super::engine::{SearchFilter, VectorEngine};
use super::measure::{Measure, VectorCoding};
use super::reformer::Reformer;
use super::{check_column_meta, check_query, column_dump_block, ContextPool};

fn image_block_name(index: usize) -> String {
    format!("EngineImage{index}")
}

/// Streams one column's vectors into a graph engine backed by its own
/// snapshot file.
pub struct ColumnIndexer {
    meta: ColumnMeta,
    snapshot: Snapshot,
    engine: VectorEngine,
    reformer: Option<Reformer>,
    context_pool: ContextPool,
}

impl ColumnIndexer {
    /// Opens `data.pxa.<column>.<segment_id>`, reloading the last flushed
    /// engine image when one exists.
    pub fn open(
        dir: &Path,
        segment_id: SegmentId,
        meta: &ColumnMeta,
        concurrency: usize,
        options: ReadOptions,
    ) -> Result<ColumnIndexer> {
        check_column_meta(meta)?;
        let snapshot =
            Snapshot::open_suffixed(dir, FileId::Column, &meta.name, segment_id, options)?;

        let params = &meta.parameters;
        let reformer = Reformer::from_quantize_type(params.quantize_type());
        let coding = match &reformer {
            Some(reformer) => reformer.output_coding(),
            None => VectorCoding::from_data_type(meta.data_type)?,
        };
        let engine = VectorEngine::new(
            params.engine(),
            coding,
            meta.dimension,
            Measure::new(params.metric_type()),
            params.ef_construction(),
            params.ef_search(),
        );

        let indexer = ColumnIndexer {
            meta: meta.clone(),
            snapshot,
            engine,
            reformer,
            context_pool: ContextPool::new(concurrency),
        };
        if !options.create_new {
            indexer.reload_image()?;
        }
        Ok(indexer)
    }

    fn reload_image(&self) -> Result<()> {
        let storage = self.snapshot.data();
        let mut latest = None;
        for i in 0.. {
            match storage.get(&image_block_name(i)) {
                Some(block) => latest = Some(block),
                None => break,
            }
        }
        if let Some(block) = latest {
            let size = block.data_size() as usize;
            if size > 0 {
                let image = block.read_bytes(0, size)?;
                self.engine.load_image(&image)?;
            }
        }
        Ok(())
    }

    pub fn column_name(&self) -> &str {
        &self.meta.name
    }

    pub fn doc_count(&self) -> u64 {
        self.engine.doc_count() as u64
    }

    pub fn file_path(&self) -> &Path {
        self.snapshot.file_path()
    }

    pub fn file_size(&self) -> u64 {
        self.snapshot.file_size()
    }

    /// Validates and indexes one vector under `doc_id`.
    pub fn insert(&self, doc_id: DocId, column_data: &ColumnData) -> Result<()> {
        if column_data.data_type != self.meta.data_type
            || column_data.dimension != self.meta.dimension
        {
            return Err(Error::InvalidRecord(format!(
                "column {} data of type {:?} dim {}",
                self.meta.name, column_data.data_type, column_data.dimension
            )));
        }
        let expected = self.meta.data_type.vector_size(self.meta.dimension);
        if column_data.data.len() != expected {
            return Err(Error::InvalidRecord(format!(
                "column {} vector of {} bytes, expected {expected}",
                self.meta.name,
                column_data.data.len()
            )));
        }

        let bytes = match &self.reformer {
            Some(reformer) => reformer.reform(self.meta.dimension, &column_data.data)?,
            None => column_data.data.clone(),
        };
        self.engine.add(doc_id, bytes)
    }

    pub fn remove(&self, doc_id: DocId) -> Result<()> {
        self.engine.remove(doc_id)
    }

    /// Rebuilds the graph over the flat store (OSWG only).
    pub fn optimize(&self) -> Result<()> {
        self.engine.optimize()
    }

    pub fn search(
        &self,
        query: &[u8],
        params: &QueryParams,
        filter: Option<SearchFilter<'_>>,
    ) -> Result<Vec<(DocId, f32)>> {
        check_query(&self.meta, params, query, 1)?;
        super::run_search(
            &self.engine,
            &self.context_pool,
            self.reformer.as_ref(),
            &self.meta,
            query,
            params,
            filter,
        )
    }

    pub fn search_batch(
        &self,
        query: &[u8],
        params: &QueryParams,
        batch: u32,
        filter: Option<SearchFilter<'_>>,
    ) -> Result<Vec<Vec<(DocId, f32)>>> {
        super::run_batch_search(
            &self.engine,
            &self.context_pool,
            self.reformer.as_ref(),
            &self.meta,
            query,
            params,
            batch,
            filter,
        )
    }

    pub fn reverse_sort(&self) -> bool {
        self.engine.measure().reverse_sort()
    }

    /// Writes the engine state as the column's dump block.
    pub fn dump<W: Write>(&self, packer: &mut Packer<W>) -> Result<()> {
        let image = self.engine.image()?;
        packer.pack_segment(&column_dump_block(&self.meta.name), &image)
    }

    /// Persists the engine image into the snapshot, then flushes it.
    pub fn flush(&self) -> Result<()> {
        let image = self.engine.image()?;
        let storage = self.snapshot.data();
        let mut next = 0;
        while storage.has(&image_block_name(next)) {
            next += 1;
        }
        let block = storage.append(&image_block_name(next), image.len() as u64)?;
        block.write(0, &image)?;
        self.snapshot.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.snapshot.close()
    }
}
