//! Common record, query and option types shared across the engine.

use serde::{Deserialize, Serialize};

use crate::meta::DataType;

/// Document identifier, unique within a collection and stable for the life
/// of the row.
pub type DocId = u64;

/// Segment identifier, allocated by the version store.
pub type SegmentId = u32;

/// Reserved primary key value.
pub const INVALID_KEY: u64 = u64::MAX;

/// Reserved document id value.
pub const INVALID_DOC_ID: DocId = u64::MAX;

/// Reserved segment id value.
pub const INVALID_SEGMENT_ID: SegmentId = u32::MAX;

/// Gap left between the max doc id of a rotated segment and the min doc id
/// of its successor, so in-flight writes against the old segment can never
/// collide with the new range.
pub const DOC_ID_INCREASE_COUNT: u64 = 1000;

/// How a record in a write batch should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// One vector column value carried by a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnData {
    pub column_name: String,
    pub data_type: DataType,
    pub dimension: u32,
    pub data: Vec<u8>,
}

/// A single row of a write request.
#[derive(Debug, Clone)]
pub struct Record {
    pub operation_type: OperationType,
    pub primary_key: u64,
    pub revision: u32,
    pub lsn: u64,
    pub lsn_context: Vec<u8>,
    pub lsn_check: bool,
    pub timestamp: u64,
    pub forward_data: Vec<u8>,
    pub column_datas: Vec<ColumnData>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            operation_type: OperationType::Insert,
            primary_key: INVALID_KEY,
            revision: 0,
            lsn: 0,
            lsn_context: Vec::new(),
            lsn_check: false,
            timestamp: 0,
            forward_data: Vec::new(),
            column_datas: Vec::new(),
        }
    }
}

/// Knn query parameters.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub topk: u32,
    pub data_type: DataType,
    pub dimension: u32,
    /// Radius filter on the normalized score; `0.0` disables it.
    pub radius: f32,
    pub query_id: u64,
    /// Brute-force scan instead of graph search.
    pub is_linear: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            topk: 10,
            data_type: DataType::VectorFp32,
            dimension: 0,
            radius: 0.0,
            query_id: 0,
            is_linear: false,
        }
    }
}

/// One knn or kv search hit.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub primary_key: u64,
    pub score: f32,
    pub revision: u32,
    pub forward_data: Vec<u8>,
    pub lsn: u64,
    /// Larger scores rank first when set (similarity measures).
    pub reverse_sort: bool,
}

impl Default for QueryResult {
    fn default() -> Self {
        Self {
            primary_key: INVALID_KEY,
            score: 0.0,
            revision: 0,
            forward_data: Vec::new(),
            lsn: 0,
            reverse_sort: false,
        }
    }
}

impl QueryResult {
    /// Ranks `self` against `other` under the measure's sort order.
    pub fn is_better_than(&self, other: &QueryResult) -> bool {
        if self.reverse_sort {
            self.score > other.score
        } else {
            self.score < other.score
        }
    }
}

/// Options controlling how snapshot files are opened.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Map files instead of buffering them in memory.
    pub use_mmap: bool,
    /// Creating from scratch is expected; opening existing data fails.
    pub create_new: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            use_mmap: true,
            create_new: false,
        }
    }
}
