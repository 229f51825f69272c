//! Read-only per-column index of a persist segment.

use std::sync::Arc;

use crate::error::Result;
use crate::meta::ColumnMeta;
use crate::storage::MappedContainer;
use crate::types::{DocId, QueryParams};

use super::engine::{SearchFilter, VectorEngine};
use super::measure::{Measure, VectorCoding};
use super::reformer::Reformer;
use super::{check_column_meta, check_query, column_dump_block, ContextPool};

/// Serves one column from a packed segment container. A column added to the
/// schema after the segment was dumped has no block; it loads as an empty
/// shadow answering every query with no hits.
pub struct ColumnReader {
    meta: ColumnMeta,
    engine: Option<VectorEngine>,
    reformer: Option<Reformer>,
    context_pool: ContextPool,
}

impl ColumnReader {
    pub fn load(
        container: &Arc<MappedContainer>,
        meta: &ColumnMeta,
        concurrency: usize,
    ) -> Result<ColumnReader> {
        check_column_meta(meta)?;

        let params = &meta.parameters;
        let reformer = Reformer::from_quantize_type(params.quantize_type());

        let engine = if container.has_block(&column_dump_block(&meta.name)) {
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
            engine.load_image(container.block(&column_dump_block(&meta.name))?)?;
            Some(engine)
        } else {
            None
        };

        Ok(ColumnReader {
            meta: meta.clone(),
            engine,
            reformer,
            context_pool: ContextPool::new(concurrency),
        })
    }

    /// An empty shadow for a column with no dumped block.
    pub fn empty_shadow(meta: &ColumnMeta, concurrency: usize) -> ColumnReader {
        ColumnReader {
            meta: meta.clone(),
            engine: None,
            reformer: Reformer::from_quantize_type(meta.parameters.quantize_type()),
            context_pool: ContextPool::new(concurrency),
        }
    }

    pub fn column_name(&self) -> &str {
        &self.meta.name
    }

    pub fn doc_count(&self) -> u64 {
        self.engine.as_ref().map(|e| e.doc_count() as u64).unwrap_or(0)
    }

    pub fn reverse_sort(&self) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.measure().reverse_sort())
            .unwrap_or(false)
    }

    pub fn search(
        &self,
        query: &[u8],
        params: &QueryParams,
        filter: Option<SearchFilter<'_>>,
    ) -> Result<Vec<(DocId, f32)>> {
        check_query(&self.meta, params, query, 1)?;
        let engine = match &self.engine {
            Some(engine) => engine,
            None => return Ok(Vec::new()),
        };
        super::run_search(
            engine,
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
        let engine = match &self.engine {
            Some(engine) => engine,
            None => {
                check_query(&self.meta, params, query, batch)?;
                return Ok(vec![Vec::new(); batch.max(1) as usize]);
            }
        };
        super::run_batch_search(
            engine,
            &self.context_pool,
            self.reformer.as_ref(),
            &self.meta,
            query,
            params,
            batch,
            filter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Packer;
    use crate::meta::DataType;
    use crate::types::{ColumnData, ReadOptions};
    use crate::column::ColumnIndexer;
    use tempfile::TempDir;

    fn encode_fp32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn make_meta() -> ColumnMeta {
        ColumnMeta::new("face", DataType::VectorFp32, 4)
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
    fn test_load_from_dumped_container() {
        let dir = TempDir::new().unwrap();
        let meta = make_meta();
        let indexer = ColumnIndexer::open(
            dir.path(),
            0,
            &meta,
            1,
            ReadOptions {
                use_mmap: true,
                create_new: true,
            },
        )
        .unwrap();
        for i in 0..60u64 {
            indexer
                .insert(
                    i,
                    &ColumnData {
                        column_name: "face".to_string(),
                        data_type: DataType::VectorFp32,
                        dimension: 4,
                        data: encode_fp32(&[i as f32, 0.0, 0.0, 0.0]),
                    },
                )
                .unwrap();
        }

        let seg_path = dir.path().join("data.seg.0");
        let mut packer = Packer::new(std::fs::File::create(&seg_path).unwrap());
        packer.setup().unwrap();
        indexer.dump(&mut packer).unwrap();
        packer.finish(0).unwrap();

        let container = Arc::new(MappedContainer::open(&seg_path, true).unwrap());
        let reader = ColumnReader::load(&container, &meta, 2).unwrap();
        assert_eq!(reader.doc_count(), 60);

        let hits = reader
            .search(&encode_fp32(&[33.0, 0.0, 0.0, 0.0]), &make_params(), None)
            .unwrap();
        assert_eq!(hits[0].0, 33);
    }

    #[test]
    fn test_empty_shadow_serves_no_hits() {
        let reader = ColumnReader::empty_shadow(&make_meta(), 1);
        let hits = reader
            .search(&encode_fp32(&[0.0; 4]), &make_params(), None)
            .unwrap();
        assert!(hits.is_empty());

        let batches = reader
            .search_batch(&encode_fp32(&[0.0; 8]), &make_params(), 2, None)
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.is_empty()));
    }
}
