//! Append-only typed log over a storage: fixed-size data blocks plus a
//! header block. Elements are random-accessible and never shrink.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::storage::{Block, Storage};

use super::{data_block_name, HEADER_BLOCK};

const NODES_PER_BLOCK: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct DeltaHeader {
    block_count: u64,
    total_size: u64,
    reserved: [u64; 6],
}

const _: () = assert!(std::mem::size_of::<DeltaHeader>() % 64 == 0);

/// Append-only log of `T` records.
pub struct DeltaStore<T: Pod> {
    storage: Storage,
    header_block: Block,
    data_blocks: RwLock<Vec<Block>>,
    header: Mutex<DeltaHeader>,
    node_count: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeltaStore<T> {
    fn node_size() -> u64 {
        std::mem::size_of::<T>() as u64
    }

    fn block_size() -> u64 {
        NODES_PER_BLOCK * Self::node_size()
    }

    /// Mounts the log on `storage`, initializing it when empty.
    pub fn mount(storage: Storage) -> Result<Self> {
        match storage.get(HEADER_BLOCK) {
            Some(header_block) => Self::load(storage, header_block),
            None => Self::init(storage),
        }
    }

    fn init(storage: Storage) -> Result<Self> {
        let header_block = storage.append(HEADER_BLOCK, std::mem::size_of::<DeltaHeader>() as u64)?;
        let header = DeltaHeader::zeroed();
        header_block.write_pod(0, &header)?;
        Ok(Self {
            storage,
            header_block,
            data_blocks: RwLock::new(Vec::new()),
            header: Mutex::new(header),
            node_count: AtomicU64::new(0),
            _marker: PhantomData,
        })
    }

    fn load(storage: Storage, header_block: Block) -> Result<Self> {
        let header: DeltaHeader = header_block.fetch_pod(0)?;
        let mut data_blocks = Vec::new();
        for i in 0..header.block_count as usize {
            let block = storage.get(&data_block_name(i)).ok_or_else(|| {
                Error::ReadData(format!("missing delta data block {i}"))
            })?;
            data_blocks.push(block);
        }
        let node_count = match data_blocks.last() {
            Some(last) => {
                (header.block_count - 1) * NODES_PER_BLOCK + last.data_size() / Self::node_size()
            }
            None => 0,
        };
        Ok(Self {
            storage,
            header_block,
            data_blocks: RwLock::new(data_blocks),
            header: Mutex::new(header),
            node_count: AtomicU64::new(node_count),
            _marker: PhantomData,
        })
    }

    /// Appends an element at the tail, allocating a new data block when the
    /// current one is full.
    pub fn append(&self, element: &T) -> Result<()> {
        let mut header = self.header.lock();

        let tail = {
            let blocks = self.data_blocks.read();
            blocks.last().filter(|b| b.data_size() < Self::block_size()).cloned()
        };
        let block = match tail {
            Some(block) => block,
            None => {
                let name = data_block_name(header.block_count as usize);
                let block = self.storage.append(&name, Self::block_size())?;
                header.block_count += 1;
                header.total_size += Self::block_size();
                self.header_block.write_pod(0, &*header)?;
                self.data_blocks.write().push(block.clone());
                block
            }
        };

        block.write_pod(block.data_size(), element)?;
        self.node_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Rewrites the element at `pos`.
    pub fn update(&self, pos: u64, element: &T) -> Result<()> {
        let _header = self.header.lock();
        if pos >= self.count() {
            return Err(Error::Runtime(format!("delta position {pos} out of range")));
        }
        let blocks = self.data_blocks.read();
        let block = &blocks[(pos / NODES_PER_BLOCK) as usize];
        let offset = (pos % NODES_PER_BLOCK) * Self::node_size();
        block.write_pod(offset, element)
    }

    /// Random-access read; no tail synchronization.
    pub fn at(&self, pos: u64) -> Option<T> {
        if pos >= self.count() {
            return None;
        }
        let blocks = self.data_blocks.read();
        let block = blocks.get((pos / NODES_PER_BLOCK) as usize)?;
        let offset = (pos % NODES_PER_BLOCK) * Self::node_size();
        block.fetch_pod(offset).ok()
    }

    pub fn count(&self) -> u64 {
        self.node_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_at() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.del");
        let storage = Storage::open(&path, true, true).unwrap();
        let delta: DeltaStore<u64> = DeltaStore::mount(storage).unwrap();

        for i in 0..100u64 {
            delta.append(&(i * 3)).unwrap();
        }
        assert_eq!(delta.count(), 100);
        assert_eq!(delta.at(0), Some(0));
        assert_eq!(delta.at(99), Some(297));
        assert_eq!(delta.at(100), None);
    }

    #[test]
    fn test_remount_recovers_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.del");

        {
            let storage = Storage::open(&path, true, true).unwrap();
            let delta: DeltaStore<u64> = DeltaStore::mount(storage.clone()).unwrap();
            for i in 0..10u64 {
                delta.append(&i).unwrap();
            }
            storage.close().unwrap();
        }

        let storage = Storage::open(&path, true, false).unwrap();
        let delta: DeltaStore<u64> = DeltaStore::mount(storage).unwrap();
        assert_eq!(delta.count(), 10);
        assert_eq!(delta.at(9), Some(9));

        delta.append(&42).unwrap();
        assert_eq!(delta.at(10), Some(42));
    }

    #[test]
    fn test_update_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.del");
        let storage = Storage::open(&path, false, true).unwrap();
        let delta: DeltaStore<u32> = DeltaStore::mount(storage).unwrap();

        delta.append(&1).unwrap();
        delta.update(0, &7).unwrap();
        assert_eq!(delta.at(0), Some(7));
        assert!(delta.update(1, &9).is_err());
    }
}
