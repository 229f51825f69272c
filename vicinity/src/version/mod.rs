//! Version manifest: the persistent record of which segments constitute the
//! live set of a collection, plus per-segment metas and a summary.
//!
//! Layout inside `data.manifest`:
//!
//! ```text
//! | SummaryBlock         | VersionBlock               | SegmentBlock     |
//! | CollectionSummary    | VersionHeader + VersionSet | SegmentMeta...   |
//! ```

mod manager;
mod store;

pub use manager::VersionManager;
pub use store::VersionStore;

use bytemuck::{Pod, Zeroable};

use crate::types::SegmentId;

/// Hard cap on segments per collection.
pub const MAX_SEGMENT_COUNT: usize = 1024;

pub(crate) const SUMMARY_BLOCK: &str = "SummaryBlock";
pub(crate) const VERSION_BLOCK: &str = "VersionBlock";
pub(crate) const SEGMENT_BLOCK: &str = "SegmentBlock";

/// Collection-wide counters mirrored into the manifest on flush.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CollectionSummary {
    pub schema_revision: u64,
    pub total_doc_count: u64,
    pub delete_doc_count: u64,
    pub reserved: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<CollectionSummary>() % 64 == 0);

/// Header of the version block.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct VersionHeader {
    pub total_version_count: u64,
    pub current_version_offset: u64,
    pub total_segment_count: u64,
    pub reserved: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<VersionHeader>() % 64 == 0);

/// The live segment-id list.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct VersionSet {
    pub segment_count: u64,
    pub reserved: [u64; 7],
    pub segment_ids: [u32; MAX_SEGMENT_COUNT],
}

const _: () = assert!(std::mem::size_of::<VersionSet>() % 64 == 0);

/// An atomic change to the live segment set.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub add_segments: Vec<SegmentId>,
    pub delete_segments: Vec<SegmentId>,
}
