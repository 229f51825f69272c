//! Per-column ANN engine wrappers: the writable indexer of a memory
//! segment and the read-only reader of a persist segment, plus the
//! measure/reformer/engine stack they share.

mod context_pool;
mod engine;
mod forward;
mod indexer;
mod measure;
mod reader;
mod reformer;

pub use context_pool::ContextPool;
pub use engine::{SearchFilter, VectorEngine};
pub use forward::{ForwardData, ForwardHeader, ForwardIndexer, ForwardReader, FORWARD_DUMP_BLOCK};
pub use indexer::ColumnIndexer;
pub use measure::{Measure, VectorCoding};
pub use reader::ColumnReader;
pub use reformer::Reformer;

use crate::error::{Error, Result};
use crate::meta::{ColumnMeta, EngineType};
use crate::types::{DocId, QueryParams};

/// Name of a dumped column block inside a segment container.
pub fn column_dump_block(column_name: &str) -> String {
    format!("ColumnIndex{column_name}")
}

/// Validates the meta a column is opened with.
fn check_column_meta(meta: &ColumnMeta) -> Result<()> {
    if meta.dimension == 0 {
        return Err(Error::Config(format!(
            "column {} has zero dimension",
            meta.name
        )));
    }
    if meta.data_type.element_size() == 0 {
        return Err(Error::Config(format!(
            "column {} has undefined data type",
            meta.name
        )));
    }
    if meta.parameters.quantize_type() != crate::meta::QuantizeType::Undefined
        && meta.data_type != crate::meta::DataType::VectorFp32
    {
        return Err(Error::Config(format!(
            "column {} quantizes non-fp32 input",
            meta.name
        )));
    }
    Ok(())
}

/// Validates one query payload against the column meta.
fn check_query(meta: &ColumnMeta, params: &QueryParams, query: &[u8], batch: u32) -> Result<()> {
    if params.topk == 0 {
        return Err(Error::InvalidQuery("topk is zero".to_string()));
    }
    if params.data_type != meta.data_type {
        return Err(Error::InvalidQuery(format!(
            "query type {:?} against column type {:?}",
            params.data_type, meta.data_type
        )));
    }
    if params.dimension != meta.dimension {
        return Err(Error::InvalidQuery(format!(
            "query dimension {} against column dimension {}",
            params.dimension, meta.dimension
        )));
    }
    let expected = meta.data_type.vector_size(meta.dimension) * batch.max(1) as usize;
    if query.len() != expected {
        return Err(Error::InvalidQuery(format!(
            "query of {} bytes, expected {expected}",
            query.len()
        )));
    }
    Ok(())
}

/// One search over an engine: reform the query, pick the graph or linear
/// path, post-filter for engines without filter pushdown, normalize scores
/// and apply the radius.
fn run_search(
    engine: &VectorEngine,
    pool: &ContextPool,
    reformer: Option<&Reformer>,
    meta: &ColumnMeta,
    query: &[u8],
    params: &QueryParams,
    filter: Option<SearchFilter<'_>>,
) -> Result<Vec<(DocId, f32)>> {
    let reformed;
    let query = match reformer {
        Some(reformer) => {
            reformed = reformer.reform(meta.dimension, query)?;
            reformed.as_slice()
        }
        None => query,
    };

    let topk = params.topk as usize;
    let hits = if params.is_linear {
        engine.search_bf(query, topk, filter)?
    } else if engine.engine_type() == EngineType::Oswg {
        // The OSWG engine takes no filter; apply it on the result path.
        let mut context = pool.acquire();
        let mut hits = engine.search(context.search(), query, topk, None)?;
        if let Some(filter) = filter {
            hits.retain(|(doc_id, _)| !filter(*doc_id));
        }
        hits
    } else {
        let mut context = pool.acquire();
        engine.search(context.search(), query, topk, filter)?
    };

    let measure = engine.measure();
    let mut out: Vec<(DocId, f32)> = hits
        .into_iter()
        .map(|(doc_id, distance)| (doc_id, measure.normalize_score(distance)))
        .collect();
    if params.radius > 0.0 {
        out.retain(|(_, score)| measure.within_radius(*score, params.radius));
    }
    Ok(out)
}

/// Splits a batched query buffer and runs one search per vector.
fn run_batch_search(
    engine: &VectorEngine,
    pool: &ContextPool,
    reformer: Option<&Reformer>,
    meta: &ColumnMeta,
    query: &[u8],
    params: &QueryParams,
    batch: u32,
    filter: Option<SearchFilter<'_>>,
) -> Result<Vec<Vec<(DocId, f32)>>> {
    check_query(meta, params, query, batch)?;
    let stride = meta.data_type.vector_size(meta.dimension);
    let mut results = Vec::with_capacity(batch.max(1) as usize);
    for chunk in query.chunks(stride) {
        results.push(run_search(engine, pool, reformer, meta, chunk, params, filter)?);
    }
    Ok(results)
}
