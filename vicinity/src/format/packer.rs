//! Streaming writer for the container envelope.

use std::io::Write;

use bytemuck::Zeroable;

use crate::error::{Error, Result};

use super::layout::{crc32, MetaFooter, MetaHeader, MetaTableBuilder, INDEX_VERSION_SEGMENT};
use super::align_up;

struct OpenSegment {
    id: String,
    data_size: u64,
    data_crc: u32,
}

/// Packs named content blocks into a container: `setup` once, then one or
/// more segments, then `finish`. Content CRCs are computed streaming.
pub struct Packer<W: Write> {
    writer: W,
    magic: u32,
    content_crc: u32,
    content_size: u64,
    segments: Vec<(String, u64, u64, u32)>,
    current: Option<OpenSegment>,
}

impl<W: Write> Packer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            magic: 0,
            content_crc: 0,
            content_size: 0,
            segments: Vec::new(),
            current: None,
        }
    }

    /// Identity stamp of the container, valid after `setup`.
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Writes the meta header.
    pub fn setup(&mut self) -> Result<()> {
        let header = MetaHeader::new();
        self.magic = header.magic;
        self.writer
            .write_all(bytemuck::bytes_of(&header))
            .map_err(|e| Error::WriteData(format!("pack header: {e}")))?;
        Ok(())
    }

    /// Opens a named segment; data goes in through [`Packer::write`].
    pub fn begin_segment(&mut self, id: &str) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::Status("segment already open".to_string()));
        }
        self.current = Some(OpenSegment {
            id: id.to_string(),
            data_size: 0,
            data_crc: 0,
        });
        Ok(())
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Status("no open segment".to_string()))?;
        self.writer
            .write_all(chunk)
            .map_err(|e| Error::WriteData(format!("pack content: {e}")))?;
        current.data_crc = crc32c::crc32c_append(current.data_crc, chunk);
        current.data_size += chunk.len() as u64;
        self.content_crc = crc32c::crc32c_append(self.content_crc, chunk);
        self.content_size += chunk.len() as u64;
        Ok(())
    }

    /// Closes the open segment, padding its data to the envelope alignment.
    pub fn end_segment(&mut self) -> Result<()> {
        let current = self
            .current
            .take()
            .ok_or_else(|| Error::Status("no open segment".to_string()))?;
        let padding = align_up(current.data_size) - current.data_size;
        if padding > 0 {
            let pad = vec![0u8; padding as usize];
            self.writer
                .write_all(&pad)
                .map_err(|e| Error::WriteData(format!("pack padding: {e}")))?;
            self.content_crc = crc32c::crc32c_append(self.content_crc, &pad);
            self.content_size += padding;
        }
        self.segments
            .push((current.id, current.data_size, padding, current.data_crc));
        Ok(())
    }

    /// Writes `data` as one complete named segment.
    pub fn pack_segment(&mut self, id: &str, data: &[u8]) -> Result<()> {
        self.begin_segment(id)?;
        self.write(data)?;
        self.end_segment()
    }

    /// Appends the reserved version segment, the meta table and the footer.
    pub fn finish(mut self, check_point: u64) -> Result<W> {
        if self.current.is_some() {
            return Err(Error::Status("segment still open".to_string()));
        }

        let version = format!("vicinity {}", env!("CARGO_PKG_VERSION"));
        self.pack_segment(INDEX_VERSION_SEGMENT, version.as_bytes())?;

        // Per-segment padding keeps the content aligned already.
        let content_padding = align_up(self.content_size) - self.content_size;
        debug_assert_eq!(content_padding, 0);

        let mut builder = MetaTableBuilder::new(self.segments.len());
        for (id, data_size, padding, data_crc) in &self.segments {
            builder.append(id, *data_size, *padding, *data_crc);
        }
        let table = builder.finish();
        self.writer
            .write_all(&table)
            .map_err(|e| Error::WriteData(format!("pack meta table: {e}")))?;

        let mut footer = MetaFooter::zeroed();
        footer.segments_meta_crc = crc32(&table);
        footer.content_crc = self.content_crc;
        footer.segment_count = self.segments.len() as u32;
        footer.segments_meta_size = table.len() as u32;
        footer.content_size = self.content_size;
        footer.content_padding_size = content_padding;
        footer.total_size = std::mem::size_of::<MetaHeader>() as u64
            + self.content_size
            + content_padding
            + table.len() as u64
            + std::mem::size_of::<MetaFooter>() as u64;
        footer.seal(check_point);

        self.writer
            .write_all(bytemuck::bytes_of(&footer))
            .map_err(|e| Error::WriteData(format!("pack footer: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| Error::WriteData(format!("pack flush: {e}")))?;
        Ok(self.writer)
    }
}
