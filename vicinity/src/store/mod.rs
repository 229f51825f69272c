//! Persistence substructures built on top of the storage blocks: typed
//! append-only logs, the persistent hash map, and the snapshot-backed
//! global stores of a collection.

mod bitmap;
mod delete_store;
mod delta;
mod hash_map;
mod id_map;
mod lsn_store;

pub use bitmap::ConcurrentBitmap;
pub use delete_store::DeleteStore;
pub use delta::DeltaStore;
pub use hash_map::PersistHashMap;
pub use id_map::IdMap;
pub use lsn_store::LsnStore;

pub(crate) const HEADER_BLOCK: &str = "HeaderBlock";
pub(crate) const DATA_BLOCK: &str = "DataBlock";

pub(crate) fn data_block_name(index: usize) -> String {
    format!("{DATA_BLOCK}{index}")
}
