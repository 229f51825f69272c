//! Binary container format shared by memory snapshots and dumped segments.
//!
//! Every persisted file has the same envelope:
//!
//! ```text
//! | MetaHeader | content blocks... | padding to 32B | SegmentMetaTable | MetaFooter |
//! ```
//!
//! All three regions carry CRC32C checksums. Mutable snapshot storages write
//! `content_crc = 0`, which elides content validation on unpack; packed
//! segment dumps always carry real checksums.

mod layout;
mod packer;
mod unpacker;

pub use layout::{
    crc32, MetaFooter, MetaHeader, MetaTableBuilder, SegmentMetaEntry, ALIGNMENT, FORMAT_VERSION,
    INDEX_VERSION_SEGMENT,
};
pub use packer::Packer;
pub use unpacker::{UnpackedSegment, Unpacker};

/// Rounds `size` up to the container alignment.
pub fn align_up(size: u64) -> u64 {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}
