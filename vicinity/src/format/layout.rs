//! On-disk POD structs of the container envelope.

use bytemuck::{Pod, Zeroable};

/// Container format version stamp.
pub const FORMAT_VERSION: u16 = 0x0002;

/// Alignment of the envelope regions.
pub const ALIGNMENT: u64 = 32;

/// Name of the reserved segment carrying the engine version string.
pub const INDEX_VERSION_SEGMENT: &str = "IndexVersion";

/// CRC32C (Castagnoli) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Leading header of every container file.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MetaHeader {
    pub header_crc: u32,
    pub reserved1: u16,
    pub version: u16,
    pub revision: u32,
    /// Random identity of this container instance.
    pub magic: u32,
    pub meta_header_size: u16,
    pub meta_footer_size: u16,
    /// Signed; a negative value is relative to the end of the file.
    pub meta_footer_offset: u32,
    pub content_offset: u32,
    pub reserved2: u32,
    pub setup_time: u64,
    pub reserved3: [u64; 3],
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() % 32 == 0);

impl MetaHeader {
    pub fn new() -> Self {
        let mut header = MetaHeader::zeroed();
        header.version = FORMAT_VERSION;
        header.magic = rand::random();
        header.meta_header_size = std::mem::size_of::<MetaHeader>() as u16;
        header.meta_footer_size = std::mem::size_of::<MetaFooter>() as u16;
        header.meta_footer_offset = (0i32 - std::mem::size_of::<MetaFooter>() as i32) as u32;
        header.content_offset = std::mem::size_of::<MetaHeader>() as u32;
        header.setup_time = unix_time();
        header.header_crc = header.compute_crc();
        header
    }

    /// CRC over the header with the crc field zeroed.
    pub fn compute_crc(&self) -> u32 {
        let mut copy = *self;
        copy.header_crc = 0;
        crc32(bytemuck::bytes_of(&copy))
    }

    /// Absolute footer offset for a file of `total` bytes.
    pub fn footer_offset(&self, total: u64) -> u64 {
        let raw = self.meta_footer_offset as i32;
        if raw < 0 {
            total.wrapping_add(raw as i64 as u64)
        } else {
            raw as u64
        }
    }
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Trailing footer of every container file.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MetaFooter {
    pub footer_crc: u32,
    pub segments_meta_crc: u32,
    /// CRC over the content region; `0` elides content validation.
    pub content_crc: u32,
    pub segment_count: u32,
    pub segments_meta_size: u32,
    pub reserved1: u32,
    pub content_size: u64,
    pub content_padding_size: u64,
    /// Monotone user-supplied token.
    pub check_point: u64,
    pub update_time: u64,
    pub reserved2: [u64; 8],
    pub total_size: u64,
}

const _: () = assert!(std::mem::size_of::<MetaFooter>() % 32 == 0);

impl MetaFooter {
    /// Stamps the update time and crc; call last.
    pub fn seal(&mut self, check_point: u64) {
        if check_point != 0 {
            self.check_point = check_point;
        }
        self.update_time = unix_time();
        self.footer_crc = 0;
        self.footer_crc = crc32(bytemuck::bytes_of(self));
    }

    pub fn compute_crc(&self) -> u32 {
        let mut copy = *self;
        copy.footer_crc = 0;
        crc32(bytemuck::bytes_of(&copy))
    }
}

/// One entry of the segment meta table.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SegmentMetaEntry {
    /// Offset of the NUL-terminated segment id in the table's string region.
    pub segment_id_offset: u32,
    pub data_crc: u32,
    /// Offset of the segment data within the content region.
    pub data_index: u64,
    pub data_size: u64,
    pub padding_size: u64,
}

const _: () = assert!(std::mem::size_of::<SegmentMetaEntry>() % 32 == 0);

/// Builds the flat segment meta table: fixed entries followed by a string
/// region referenced by `segment_id_offset`, the whole buffer padded to the
/// container alignment.
pub struct MetaTableBuilder {
    buffer: Vec<u8>,
    capacity: usize,
    count: usize,
    offset: u64,
}

impl MetaTableBuilder {
    pub fn new(segment_count: usize) -> Self {
        Self {
            buffer: vec![0u8; segment_count * std::mem::size_of::<SegmentMetaEntry>()],
            capacity: segment_count,
            count: 0,
            offset: 0,
        }
    }

    /// Appends one segment record; ids land in insertion order so data
    /// offsets accumulate.
    pub fn append(&mut self, id: &str, data_size: u64, padding_size: u64, data_crc: u32) -> bool {
        if self.count >= self.capacity {
            return false;
        }
        let entry = SegmentMetaEntry {
            segment_id_offset: self.buffer.len() as u32,
            data_crc,
            data_index: self.offset,
            data_size,
            padding_size,
        };
        let pos = self.count * std::mem::size_of::<SegmentMetaEntry>();
        self.buffer[pos..pos + std::mem::size_of::<SegmentMetaEntry>()]
            .copy_from_slice(bytemuck::bytes_of(&entry));
        self.buffer.extend_from_slice(id.as_bytes());
        self.buffer.push(0);
        self.count += 1;
        self.offset += data_size + padding_size;
        true
    }

    /// Pads and returns the finished table bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let padded = super::align_up(self.buffer.len() as u64) as usize;
        self.buffer.resize(padded, 0);
        self.buffer
    }
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes_and_crc() {
        let header = MetaHeader::new();
        assert_eq!(header.meta_header_size as usize, 64);
        assert_eq!(header.meta_footer_size as usize, 128);
        assert_eq!(header.header_crc, header.compute_crc());
    }

    #[test]
    fn test_footer_offset_is_end_relative() {
        let header = MetaHeader::new();
        assert_eq!(header.footer_offset(1024), 1024 - 128);
    }

    #[test]
    fn test_footer_seal_crc() {
        let mut footer = MetaFooter::zeroed();
        footer.content_size = 96;
        footer.seal(7);
        assert_eq!(footer.check_point, 7);
        assert_eq!(footer.footer_crc, footer.compute_crc());
    }

    #[test]
    fn test_meta_table_layout() {
        let mut builder = MetaTableBuilder::new(2);
        assert!(builder.append("alpha", 64, 0, 1));
        assert!(builder.append("beta", 32, 32, 2));
        assert!(!builder.append("gamma", 1, 0, 3));

        let table = builder.finish();
        assert_eq!(table.len() % 32, 0);

        let second: SegmentMetaEntry =
            bytemuck::pod_read_unaligned(&table[32..64]);
        assert_eq!(second.data_index, 64);
        let name_end = table[second.segment_id_offset as usize..]
            .iter()
            .position(|&b| b == 0)
            .unwrap();
        let name = &table[second.segment_id_offset as usize..]
            [..name_end];
        assert_eq!(name, b"beta");
    }
}
