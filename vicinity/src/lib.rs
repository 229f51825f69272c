//! Vicinity: a single-node, embeddable approximate-nearest-neighbor
//! collection engine.
//!
//! A [`Collection`] ingests rows of a primary key, an optional forward
//! payload and one or more fixed-dimension vectors, builds graph indices
//! incrementally, and answers top-k similarity queries, radius filters and
//! key lookups. Writes land in one in-memory segment; at the configured doc
//! cap the segment rotates and a background task packs it into an immutable
//! CRC-checked container, published atomically through the version
//! manifest. Reopening a collection recovers from the manifest and the
//! snapshot files and resumes any unfinished dump.

pub mod collection;
pub mod column;
pub mod error;
pub mod executor;
pub mod format;
pub mod meta;
pub mod segment;
pub mod storage;
pub mod store;
pub mod types;
pub mod version;

pub use collection::{Collection, CollectionStats};
pub use error::{Error, Result};
pub use executor::TaskScheduler;
pub use meta::{CollectionMeta, ColumnMeta, DataType, EngineType, MetricType, QuantizeType};
pub use types::{
    ColumnData, DocId, OperationType, QueryParams, QueryResult, ReadOptions, Record, SegmentId,
    DOC_ID_INCREASE_COUNT, INVALID_DOC_ID, INVALID_KEY,
};
