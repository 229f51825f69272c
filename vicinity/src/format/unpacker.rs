//! Validating reader for the container envelope.

use std::collections::HashMap;

use crate::error::{Error, Result};

use super::layout::{crc32, MetaFooter, MetaHeader, SegmentMetaEntry, INDEX_VERSION_SEGMENT};

/// Location of one named content block inside an unpacked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackedSegment {
    /// Absolute offset of the block data within the file.
    pub data_offset: u64,
    pub data_size: u64,
    pub padding_size: u64,
    pub data_crc: u32,
}

/// Parses and validates a container file image.
pub struct Unpacker {
    header: MetaHeader,
    footer: MetaFooter,
    version: String,
    segments: HashMap<String, UnpackedSegment>,
}

impl Unpacker {
    /// Unpacks `file` (the complete container image). With `checksum` set,
    /// the content region is re-hashed and compared to the footer.
    pub fn unpack(file: &[u8], checksum: bool) -> Result<Self> {
        let header = Self::unpack_header(file)?;
        let footer = Self::unpack_footer(&header, file)?;
        let segments = Self::unpack_segments(&header, &footer, file)?;
        if checksum {
            Self::validate_checksum(&header, &footer, file)?;
        }
        let version = Self::unpack_version(&segments, file)?;
        Ok(Self {
            header,
            footer,
            version,
            segments,
        })
    }

    pub fn header(&self) -> &MetaHeader {
        &self.header
    }

    pub fn footer(&self) -> &MetaFooter {
        &self.footer
    }

    pub fn magic(&self) -> u32 {
        self.header.magic
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn segments(&self) -> &HashMap<String, UnpackedSegment> {
        &self.segments
    }

    pub fn segment(&self, id: &str) -> Option<&UnpackedSegment> {
        self.segments.get(id)
    }

    fn unpack_header(file: &[u8]) -> Result<MetaHeader> {
        let header_size = std::mem::size_of::<MetaHeader>();
        if file.len() < header_size {
            return Err(Error::UnpackIndex("file shorter than header".to_string()));
        }
        let header: MetaHeader = bytemuck::pod_read_unaligned(&file[..header_size]);
        if header.meta_header_size as usize != header_size {
            return Err(Error::UnpackIndex("header size mismatch".to_string()));
        }
        if header.compute_crc() != header.header_crc {
            return Err(Error::UnpackIndex("header crc mismatch".to_string()));
        }
        Ok(header)
    }

    fn unpack_footer(header: &MetaHeader, file: &[u8]) -> Result<MetaFooter> {
        let footer_size = std::mem::size_of::<MetaFooter>();
        if header.meta_footer_size as usize != footer_size {
            return Err(Error::UnpackIndex("footer size mismatch".to_string()));
        }
        let total = file.len() as u64;
        let offset = header.footer_offset(total);
        if offset + footer_size as u64 > total {
            return Err(Error::UnpackIndex("footer outside file".to_string()));
        }
        let footer: MetaFooter =
            bytemuck::pod_read_unaligned(&file[offset as usize..offset as usize + footer_size]);
        if footer.total_size != total {
            return Err(Error::UnpackIndex("total size mismatch".to_string()));
        }
        if footer.content_size + footer.content_padding_size + header.content_offset as u64 > total
        {
            return Err(Error::UnpackIndex("content size mismatch".to_string()));
        }
        if footer.compute_crc() != footer.footer_crc {
            return Err(Error::UnpackIndex("footer crc mismatch".to_string()));
        }
        Ok(footer)
    }

    fn unpack_segments(
        header: &MetaHeader,
        footer: &MetaFooter,
        file: &[u8],
    ) -> Result<HashMap<String, UnpackedSegment>> {
        let entry_size = std::mem::size_of::<SegmentMetaEntry>();
        let table_size = footer.segments_meta_size as u64;
        if entry_size as u64 * footer.segment_count as u64 > table_size {
            return Err(Error::UnpackIndex("segment table overflow".to_string()));
        }

        let footer_offset = header.footer_offset(file.len() as u64);
        if footer_offset < table_size {
            return Err(Error::UnpackIndex("segment table outside file".to_string()));
        }
        let table_offset = (footer_offset - table_size) as usize;
        let table = &file[table_offset..table_offset + table_size as usize];
        if crc32(table) != footer.segments_meta_crc {
            return Err(Error::UnpackIndex("segment table crc mismatch".to_string()));
        }

        let mut segments = HashMap::new();
        for i in 0..footer.segment_count as usize {
            let entry: SegmentMetaEntry =
                bytemuck::pod_read_unaligned(&table[i * entry_size..(i + 1) * entry_size]);
            if entry.segment_id_offset as u64 > table_size {
                return Err(Error::UnpackIndex("segment id outside table".to_string()));
            }
            if entry.data_index + entry.data_size > footer.content_size {
                return Err(Error::UnpackIndex("segment data outside content".to_string()));
            }
            let name_region = &table[entry.segment_id_offset as usize..];
            let name_end = name_region
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::UnpackIndex("unterminated segment id".to_string()))?;
            let name = String::from_utf8_lossy(&name_region[..name_end]).into_owned();
            segments.insert(
                name,
                UnpackedSegment {
                    data_offset: entry.data_index + header.content_offset as u64,
                    data_size: entry.data_size,
                    padding_size: entry.padding_size,
                    data_crc: entry.data_crc,
                },
            );
        }
        Ok(segments)
    }

    fn validate_checksum(header: &MetaHeader, footer: &MetaFooter, file: &[u8]) -> Result<()> {
        if footer.content_crc == 0 {
            return Ok(());
        }
        let start = header.content_offset as usize;
        let end = start + footer.content_size as usize;
        let mut crc = 0u32;
        for chunk in file[start..end].chunks(4096) {
            crc = crc32c::crc32c_append(crc, chunk);
        }
        if crc != footer.content_crc {
            return Err(Error::UnpackIndex("content crc mismatch".to_string()));
        }
        Ok(())
    }

    fn unpack_version(
        segments: &HashMap<String, UnpackedSegment>,
        file: &[u8],
    ) -> Result<String> {
        let segment = segments
            .get(INDEX_VERSION_SEGMENT)
            .ok_or_else(|| Error::UnpackIndex("missing version segment".to_string()))?;
        let start = segment.data_offset as usize;
        let data = &file[start..start + segment.data_size as usize];
        if segment.data_crc != 0 && crc32(data) != segment.data_crc {
            return Err(Error::UnpackIndex("version segment crc mismatch".to_string()));
        }
        Ok(String::from_utf8_lossy(data).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Packer;

    fn make_container() -> Vec<u8> {
        let mut packer = Packer::new(Vec::new());
        packer.setup().unwrap();
        packer.pack_segment("ForwardIndex", b"forward-bytes").unwrap();
        packer.pack_segment("ColumnIndexface", &[7u8; 100]).unwrap();
        packer.finish(0).unwrap()
    }

    #[test]
    fn test_unpack_roundtrip() {
        let bytes = make_container();
        let unpacker = Unpacker::unpack(&bytes, true).unwrap();

        assert!(unpacker.version().starts_with("vicinity"));
        let fwd = unpacker.segment("ForwardIndex").unwrap();
        assert_eq!(fwd.data_size, 13);
        let start = fwd.data_offset as usize;
        assert_eq!(&bytes[start..start + 13], b"forward-bytes");

        let col = unpacker.segment("ColumnIndexface").unwrap();
        assert_eq!(col.data_size, 100);
        assert_eq!(col.padding_size, 28);
    }

    #[test]
    fn test_corruption_is_detected() {
        let clean = make_container();

        // Header, content, table and footer corruption must all surface as
        // unpack failures.
        for offset in [8usize, 70, clean.len() - 160, clean.len() - 100] {
            let mut bytes = clean.clone();
            bytes[offset] ^= 0xff;
            assert!(
                matches!(Unpacker::unpack(&bytes, true), Err(Error::UnpackIndex(_))),
                "corruption at {offset} went undetected"
            );
        }
    }

    #[test]
    fn test_truncated_file_fails() {
        let bytes = make_container();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(Unpacker::unpack(truncated, false).is_err());
    }

    #[test]
    fn test_zero_content_crc_skips_validation() {
        let mut bytes = make_container();
        // Rewrite the footer with an elided content crc.
        let footer_at = bytes.len() - std::mem::size_of::<MetaFooter>();
        let mut footer: MetaFooter = bytemuck::pod_read_unaligned(&bytes[footer_at..]);
        footer.content_crc = 0;
        footer.seal(0);
        bytes[footer_at..].copy_from_slice(bytemuck::bytes_of(&footer));

        let unpacker = Unpacker::unpack(&bytes, true).unwrap();
        assert!(unpacker.segment("ForwardIndex").is_some());
    }
}
