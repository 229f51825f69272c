//! Byte containers backing every persisted file.
//!
//! A [`Storage`] exposes appendable named blocks inside one file wearing the
//! container envelope. Two interchangeable backends exist: a buffered memory
//! backend and an mmap backend. Mutations go to the content region
//! immediately; the meta table and footer are rewritten on `flush`/`close`,
//! which is the durability boundary for reopening the file.

mod mapped;
mod memory;
mod mmap;
mod snapshot;

pub use mapped::MappedContainer;
pub use snapshot::Snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::format::{
    align_up, MetaFooter, MetaHeader, MetaTableBuilder, Unpacker, INDEX_VERSION_SEGMENT,
};
use crate::types::SegmentId;

use memory::MemoryBuffer;
use mmap::MmapBuffer;

/// Well-known files of a collection directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    Id,
    Delete,
    Forward,
    Column,
    Segment,
    Lsn,
    Manifest,
}

impl FileId {
    pub fn file_name(&self) -> &'static str {
        match self {
            FileId::Id => "data.id",
            FileId::Delete => "data.del",
            FileId::Forward => "data.fwd",
            FileId::Column => "data.pxa",
            FileId::Segment => "data.seg",
            FileId::Lsn => "data.lsn",
            FileId::Manifest => "data.manifest",
        }
    }

    /// `<dir>/<file_name>`
    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// `<dir>/<file_name>.<segment_id>`
    pub fn segment_file_path(&self, dir: &Path, segment_id: SegmentId) -> PathBuf {
        dir.join(format!("{}.{}", self.file_name(), segment_id))
    }

    /// `<dir>/<file_name>.<suffix>.<segment_id>`
    pub fn suffixed_file_path(&self, dir: &Path, suffix: &str, segment_id: SegmentId) -> PathBuf {
        dir.join(format!("{}.{}.{}", self.file_name(), suffix, segment_id))
    }
}

enum ContentBuffer {
    Memory(MemoryBuffer),
    Mmap(MmapBuffer),
}

impl ContentBuffer {
    fn grow(&mut self, new_len: u64) -> Result<()> {
        match self {
            ContentBuffer::Memory(b) => b.grow(new_len),
            ContentBuffer::Mmap(b) => b.grow(new_len),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            ContentBuffer::Memory(b) => b.write_at(offset, data),
            ContentBuffer::Mmap(b) => b.write_at(offset, data),
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            ContentBuffer::Memory(b) => b.read_at(offset, buf),
            ContentBuffer::Mmap(b) => b.read_at(offset, buf),
        }
    }

    fn persist(&mut self, path: &Path) -> Result<()> {
        match self {
            ContentBuffer::Memory(b) => b.persist(path),
            ContentBuffer::Mmap(b) => b.sync(),
        }
    }
}

struct BlockMeta {
    name: String,
    /// Absolute offset of the block data within the file.
    offset: u64,
    capacity: u64,
    data_size: AtomicU64,
}

struct StorageCore {
    path: PathBuf,
    header: MetaHeader,
    buffer: RwLock<ContentBuffer>,
    blocks: RwLock<Vec<Arc<BlockMeta>>>,
    index: RwLock<HashMap<String, usize>>,
    /// End of the reserved content region (absolute file offset).
    content_end: AtomicU64,
    check_point: AtomicU64,
    closed: AtomicBool,
}

impl StorageCore {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Status("storage closed".to_string()));
        }
        Ok(())
    }
}

/// A named region of a storage file. Handles are cheap to clone and stay
/// valid across appends of other blocks.
#[derive(Clone)]
pub struct Block {
    core: Arc<StorageCore>,
    meta: Arc<BlockMeta>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn capacity(&self) -> u64 {
        self.meta.capacity
    }

    pub fn data_size(&self) -> u64 {
        self.meta.data_size.load(Ordering::Acquire)
    }

    /// Space left between `data_size` and `capacity`.
    pub fn padding_size(&self) -> u64 {
        self.meta.capacity - self.data_size()
    }

    /// Sets the live data size without touching bytes.
    pub fn resize(&self, size: u64) -> Result<()> {
        if size > self.meta.capacity {
            return Err(Error::ExceedLimit(format!(
                "resize {} past capacity {}",
                size, self.meta.capacity
            )));
        }
        self.meta.data_size.store(size, Ordering::Release);
        Ok(())
    }

    /// Writes at `offset`, extending the live data size when the write ends
    /// past it.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.core.check_open()?;
        let end = offset + data.len() as u64;
        if end > self.meta.capacity {
            return Err(Error::WriteData(format!(
                "write past block capacity: {} > {}",
                end, self.meta.capacity
            )));
        }
        self.core
            .buffer
            .write()
            .write_at(self.meta.offset + offset, data)?;
        self.meta.data_size.fetch_max(end, Ordering::AcqRel);
        Ok(data.len())
    }

    /// Copying read of `buf.len()` bytes at `offset`.
    pub fn fetch(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.core.check_open()?;
        let end = offset + buf.len() as u64;
        if end > self.meta.capacity {
            return Err(Error::ReadData(format!(
                "read past block capacity: {} > {}",
                end, self.meta.capacity
            )));
        }
        self.core
            .buffer
            .read()
            .read_at(self.meta.offset + offset, buf)?;
        Ok(buf.len())
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fetch(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        let written = self.write(offset, bytemuck::bytes_of(value))?;
        if written != std::mem::size_of::<T>() {
            return Err(Error::WriteData("short pod write".to_string()));
        }
        Ok(())
    }

    pub fn fetch_pod<T: Pod>(&self, offset: u64) -> Result<T> {
        let buf = self.read_bytes(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }
}

/// One container file exposing appendable named blocks.
#[derive(Clone)]
pub struct Storage {
    core: Arc<StorageCore>,
}

impl Storage {
    /// Opens `path` with the chosen backend. With `create_new` the file must
    /// not exist yet; otherwise it must be a well-formed container.
    pub fn open(path: &Path, use_mmap: bool, create_new: bool) -> Result<Storage> {
        if create_new {
            Self::create(path, use_mmap)
        } else {
            Self::load(path, use_mmap)
        }
    }

    fn create(path: &Path, use_mmap: bool) -> Result<Storage> {
        if path.exists() {
            return Err(Error::Status(format!(
                "storage file already exists: {}",
                path.display()
            )));
        }
        let header = MetaHeader::new();
        let header_len = std::mem::size_of::<MetaHeader>() as u64;
        let mut buffer = if use_mmap {
            ContentBuffer::Mmap(MmapBuffer::create(path, header_len)?)
        } else {
            ContentBuffer::Memory(MemoryBuffer::create(header_len))
        };
        buffer.write_at(0, bytemuck::bytes_of(&header))?;

        let storage = Storage {
            core: Arc::new(StorageCore {
                path: path.to_path_buf(),
                header,
                buffer: RwLock::new(buffer),
                blocks: RwLock::new(Vec::new()),
                index: RwLock::new(HashMap::new()),
                content_end: AtomicU64::new(header_len),
                check_point: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        };

        // The reserved version block keeps the envelope self-describing.
        let version = format!("vicinity {}", env!("CARGO_PKG_VERSION"));
        let block = storage.append(INDEX_VERSION_SEGMENT, version.len() as u64)?;
        block.write(0, version.as_bytes())?;
        Ok(storage)
    }

    fn load(path: &Path, use_mmap: bool) -> Result<Storage> {
        if !path.exists() {
            return Err(Error::InvalidIndexDataFormat(format!(
                "missing storage file {}",
                path.display()
            )));
        }
        let image = std::fs::read(path)?;
        let unpacker = Unpacker::unpack(&image, false)?;
        let header = *unpacker.header();
        let content_end = header.content_offset as u64 + unpacker.footer().content_size;
        let check_point = unpacker.footer().check_point;

        let mut blocks: Vec<Arc<BlockMeta>> = Vec::new();
        for (name, segment) in unpacker.segments() {
            blocks.push(Arc::new(BlockMeta {
                name: name.clone(),
                offset: segment.data_offset,
                capacity: segment.data_size + segment.padding_size,
                data_size: AtomicU64::new(segment.data_size),
            }));
        }
        // Restore append order so later appends continue past the last block.
        blocks.sort_by_key(|b| b.offset);
        let index = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.clone(), i))
            .collect();

        let buffer = if use_mmap {
            ContentBuffer::Mmap(MmapBuffer::load(path, content_end)?)
        } else {
            ContentBuffer::Memory(MemoryBuffer::load(image, content_end))
        };

        Ok(Storage {
            core: Arc::new(StorageCore {
                path: path.to_path_buf(),
                header,
                buffer: RwLock::new(buffer),
                blocks: RwLock::new(blocks),
                index: RwLock::new(index),
                content_end: AtomicU64::new(content_end),
                check_point: AtomicU64::new(check_point),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn magic(&self) -> u32 {
        self.core.header.magic
    }

    pub fn set_check_point(&self, check_point: u64) {
        self.core.check_point.store(check_point, Ordering::Release);
    }

    pub fn check_point(&self) -> u64 {
        self.core.check_point.load(Ordering::Acquire)
    }

    /// Reserves a new named block of `size` bytes at the content tail.
    pub fn append(&self, id: &str, size: u64) -> Result<Block> {
        self.core.check_open()?;
        if self.has(id) {
            return Err(Error::Status(format!("block {id} already exists")));
        }
        let reserved = align_up(size.max(1));
        let offset = self.core.content_end.load(Ordering::Acquire);

        let mut buffer = self.core.buffer.write();
        buffer.grow(offset + reserved)?;
        // The region may hold a stale meta table from an earlier flush.
        buffer.write_at(offset, &vec![0u8; reserved as usize])?;
        self.core
            .content_end
            .store(offset + reserved, Ordering::Release);
        drop(buffer);

        let meta = Arc::new(BlockMeta {
            name: id.to_string(),
            offset,
            capacity: reserved,
            data_size: AtomicU64::new(0),
        });
        let mut blocks = self.core.blocks.write();
        let slot = blocks.len();
        blocks.push(meta.clone());
        self.core.index.write().insert(id.to_string(), slot);

        Ok(Block {
            core: self.core.clone(),
            meta,
        })
    }

    pub fn get(&self, id: &str) -> Option<Block> {
        let slot = *self.core.index.read().get(id)?;
        let meta = self.core.blocks.read()[slot].clone();
        Some(Block {
            core: self.core.clone(),
            meta,
        })
    }

    pub fn has(&self, id: &str) -> bool {
        self.core.index.read().contains_key(id)
    }

    /// Rewrites the meta table and footer after the content region and
    /// persists the file. This is the durability boundary.
    pub fn flush(&self) -> Result<()> {
        self.core.check_open()?;

        // Hold the buffer lock throughout so appends cannot move the
        // content tail between table computation and the write.
        let mut buffer = self.core.buffer.write();
        let blocks = self.core.blocks.read();
        let header_len = std::mem::size_of::<MetaHeader>() as u64;
        let content_size = self.core.content_end.load(Ordering::Acquire) - header_len;

        let mut builder = MetaTableBuilder::new(blocks.len());
        for block in blocks.iter() {
            let data_size = block.data_size.load(Ordering::Acquire);
            builder.append(&block.name, data_size, block.capacity - data_size, 0);
        }
        let table = builder.finish();
        let segment_count = blocks.len() as u32;
        drop(blocks);

        let mut footer = MetaFooter::zeroed();
        footer.segments_meta_crc = crate::format::crc32(&table);
        footer.content_crc = 0;
        footer.segment_count = segment_count;
        footer.segments_meta_size = table.len() as u32;
        footer.content_size = content_size;
        footer.content_padding_size = 0;
        footer.total_size = header_len
            + content_size
            + table.len() as u64
            + std::mem::size_of::<MetaFooter>() as u64;
        footer.seal(self.check_point());

        let table_at = header_len + content_size;
        buffer.grow(footer.total_size)?;
        buffer.write_at(table_at, &table)?;
        buffer.write_at(table_at + table.len() as u64, bytemuck::bytes_of(&footer))?;
        buffer.persist(&self.core.path)
    }

    /// Touches every content page so mapped files fault in up front.
    pub fn warm_up(&self) {
        let buffer = self.core.buffer.read();
        let len = self.core.content_end.load(Ordering::Acquire);
        let mut probe = [0u8; 1];
        let mut sink = 0u8;
        let mut offset = 0;
        while offset < len {
            if buffer.read_at(offset, &mut probe).is_ok() {
                sink ^= probe[0];
            }
            offset += 4096;
        }
        std::hint::black_box(sink);
    }

    pub fn close(&self) -> Result<()> {
        self.core.check_open()?;
        self.flush()?;
        self.core.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roundtrip(use_mmap: bool) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.id");

        let storage = Storage::open(&path, use_mmap, true).unwrap();
        let block = storage.append("HeaderBlock", 64).unwrap();
        block.write(0, b"hello block").unwrap();
        let data = storage.append("DataBlock0", 4096).unwrap();
        data.write(0, &[0xabu8; 100]).unwrap();
        storage.close().unwrap();

        let reopened = Storage::open(&path, use_mmap, false).unwrap();
        let block = reopened.get("HeaderBlock").unwrap();
        assert_eq!(block.data_size(), 11);
        assert_eq!(block.read_bytes(0, 11).unwrap(), b"hello block");
        let data = reopened.get("DataBlock0").unwrap();
        assert_eq!(data.data_size(), 100);
        assert!(reopened.has(INDEX_VERSION_SEGMENT));
        assert!(!reopened.has("Nope"));
    }

    #[test]
    fn test_memory_roundtrip() {
        roundtrip(false);
    }

    #[test]
    fn test_mmap_roundtrip() {
        roundtrip(true);
    }

    #[test]
    fn test_append_after_reopen_extends_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.del");

        let storage = Storage::open(&path, true, true).unwrap();
        storage.append("DataBlock0", 128).unwrap();
        storage.close().unwrap();

        let reopened = Storage::open(&path, true, false).unwrap();
        let b1 = reopened.append("DataBlock1", 128).unwrap();
        b1.write(0, &[1u8; 64]).unwrap();
        reopened.flush().unwrap();

        let again = Storage::open(&path, true, false).unwrap();
        assert_eq!(again.get("DataBlock1").unwrap().data_size(), 64);
        assert_eq!(again.get("DataBlock0").unwrap().data_size(), 0);
    }

    #[test]
    fn test_write_past_capacity_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.lsn");
        let storage = Storage::open(&path, false, true).unwrap();
        let block = storage.append("DataBlock0", 32).unwrap();
        assert!(block.write(0, &[0u8; 33]).is_err());
        assert!(block.write(0, &[0u8; 32]).is_ok());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.id");
        Storage::open(&path, false, true).unwrap().close().unwrap();
        assert!(Storage::open(&path, false, true).is_err());
    }

    #[test]
    fn test_resize_and_padding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.lsn");
        let storage = Storage::open(&path, true, true).unwrap();
        let block = storage.append("DataBlock0", 64).unwrap();
        block.write(0, &[9u8; 48]).unwrap();
        assert_eq!(block.padding_size(), 16);
        block.resize(0).unwrap();
        assert_eq!(block.data_size(), 0);
        assert!(block.resize(65).is_err());
    }
}
