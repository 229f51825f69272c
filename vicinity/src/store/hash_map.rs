//! Block-chained hash map persisted in a storage: buckets and nodes live in
//! one or more blocks of doubling capacity, mutations write through, and a
//! single RW lock covers the whole map.
//!
//! Each block lays out as:
//!
//! ```text
//! | BlockHeader | bucket_indices: [u32; bucket_count] | nodes: [K V next; bucket_count] |
//! ```
//!
//! `next` threads either the bucket chain (live nodes) or the block's free
//! list. Lookups walk blocks newest-first, so a re-emplaced key in a newer
//! block shadows older versions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::storage::{Block, Storage};

use super::data_block_name;

pub(crate) const INVALID_NODE_ID: u32 = u32::MAX;

const INIT_BUCKET_COUNT: u64 = 1024;
const LOAD_FACTOR: u64 = 1;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BlockHeader {
    bucket_count: u32,
    node_count: u32,
    free_header: u32,
    reserved: [u32; 13],
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() % 64 == 0);

struct MapInner {
    blocks: Vec<Block>,
    headers: Vec<BlockHeader>,
}

/// Where a lookup landed: node index plus its predecessor in the chain.
struct FoundNode {
    block_idx: usize,
    node_idx: u32,
    prev_node_idx: u32,
    bucket_offset: u64,
}

/// Persistent hash map over `Pod` keys and values.
pub struct PersistHashMap<K, V> {
    storage: Storage,
    inner: RwLock<MapInner>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> PersistHashMap<K, V>
where
    K: Pod + Eq + Hash,
    V: Pod,
{
    fn key_size() -> u64 {
        std::mem::size_of::<K>() as u64
    }

    fn value_size() -> u64 {
        std::mem::size_of::<V>() as u64
    }

    fn node_size() -> u64 {
        Self::key_size() + Self::value_size() + 4
    }

    fn block_size(bucket_count: u64) -> u64 {
        std::mem::size_of::<BlockHeader>() as u64
            + bucket_count * 4
            + bucket_count * LOAD_FACTOR * Self::node_size()
    }

    fn hash(key: &K) -> u64 {
        // DefaultHasher with fixed keys keeps bucket placement stable
        // across restarts.
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn bucket_offset(hash: u64, bucket_count: u32) -> u64 {
        std::mem::size_of::<BlockHeader>() as u64 + (hash % bucket_count as u64) * 4
    }

    fn node_offset(bucket_count: u32, node_idx: u32) -> u64 {
        std::mem::size_of::<BlockHeader>() as u64
            + bucket_count as u64 * 4
            + node_idx as u64 * Self::node_size()
    }

    /// Mounts the map, re-initializing any block whose stored size does not
    /// match its derived layout (the only crash-recovery path needed).
    pub fn mount(storage: Storage) -> Result<Self> {
        let mut inner = MapInner {
            blocks: Vec::new(),
            headers: Vec::new(),
        };

        for i in 0.. {
            let block = match storage.get(&data_block_name(i)) {
                Some(block) => block,
                None => break,
            };
            let mut header: BlockHeader = block.fetch_pod(0)?;
            let block_size = Self::block_size(header.bucket_count as u64);
            if block.capacity() < block_size {
                return Err(Error::ReadData(format!(
                    "hash block {i} smaller than derived size"
                )));
            }
            if block.data_size() != block_size {
                tracing::debug!(block = i, "reinitializing malformed hash block");
                header = Self::init_block(&block, header.bucket_count)?;
            }
            inner.blocks.push(block);
            inner.headers.push(header);
        }

        Ok(Self {
            storage,
            inner: RwLock::new(inner),
            _marker: PhantomData,
        })
    }

    /// Pre-allocates the first block with at least `bucket_count` buckets.
    pub fn reserve(&self, bucket_count: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.blocks.is_empty() {
            Self::add_block(&self.storage, &mut inner, bucket_count)?;
        }
        Ok(())
    }

    pub fn emplace(&self, key: &K, value: &V) -> Result<()> {
        let mut inner = self.inner.write();
        Self::emplace_locked(&self.storage, &mut inner, key, value)
    }

    /// Rewrites the value in place when the key exists, emplaces otherwise.
    pub fn emplace_or_assign(&self, key: &K, value: &V) -> Result<()> {
        let mut inner = self.inner.write();
        match Self::find_key(&inner, key)? {
            Some(found) => {
                let block = &inner.blocks[found.block_idx];
                let bucket_count = inner.headers[found.block_idx].bucket_count;
                let offset = Self::node_offset(bucket_count, found.node_idx) + Self::key_size();
                block.write(offset, bytemuck::bytes_of(value))?;
                Ok(())
            }
            None => Self::emplace_locked(&self.storage, &mut inner, key, value),
        }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner.read();
        match Self::find_key(&inner, key)? {
            Some(found) => {
                let block = &inner.blocks[found.block_idx];
                let bucket_count = inner.headers[found.block_idx].bucket_count;
                let offset = Self::node_offset(bucket_count, found.node_idx) + Self::key_size();
                let buf = block.read_bytes(offset, Self::value_size() as usize)?;
                Ok(Some(bytemuck::pod_read_unaligned(&buf)))
            }
            None => Ok(None),
        }
    }

    pub fn has(&self, key: &K) -> bool {
        let inner = self.inner.read();
        matches!(Self::find_key(&inner, key), Ok(Some(_)))
    }

    /// Unlinks the key from its bucket chain and recycles the node.
    pub fn erase(&self, key: &K) -> Result<bool> {
        let mut inner = self.inner.write();
        let found = match Self::find_key(&inner, key)? {
            Some(found) => found,
            None => return Ok(false),
        };

        let block = inner.blocks[found.block_idx].clone();
        let bucket_count = inner.headers[found.block_idx].bucket_count;
        let (_, _, next) = Self::read_node(&block, bucket_count, found.node_idx)?;

        if found.prev_node_idx == INVALID_NODE_ID {
            block.write(found.bucket_offset, bytemuck::bytes_of(&next))?;
        } else {
            let next_at =
                Self::node_offset(bucket_count, found.prev_node_idx) + Self::node_size() - 4;
            block.write(next_at, bytemuck::bytes_of(&next))?;
        }

        let header = &mut inner.headers[found.block_idx];
        let next_at = Self::node_offset(bucket_count, found.node_idx) + Self::node_size() - 4;
        block.write(next_at, bytemuck::bytes_of(&header.free_header))?;
        header.free_header = found.node_idx;
        header.node_count -= 1;
        block.write_pod(0, header)?;
        Ok(true)
    }

    /// Live entry count across all blocks.
    pub fn size(&self) -> u64 {
        let inner = self.inner.read();
        inner.headers.iter().map(|h| h.node_count as u64).sum()
    }

    fn emplace_locked(
        storage: &Storage,
        inner: &mut MapInner,
        key: &K,
        value: &V,
    ) -> Result<()> {
        let block_idx = inner
            .headers
            .iter()
            .rposition(|h| h.free_header != INVALID_NODE_ID);
        let block_idx = match block_idx {
            Some(idx) => idx,
            None => Self::add_block(storage, inner, 0)?,
        };

        let block = inner.blocks[block_idx].clone();
        let header = &mut inner.headers[block_idx];
        let bucket_count = header.bucket_count;

        // Take the node off the free list.
        let free_idx = header.free_header;
        let (_, _, free_next) = Self::read_node(&block, bucket_count, free_idx)?;
        header.free_header = free_next;
        header.node_count += 1;

        // Link it at the bucket head.
        let bucket_offset = Self::bucket_offset(Self::hash(key), bucket_count);
        let head_buf = block.read_bytes(bucket_offset, 4)?;
        let head: u32 = bytemuck::pod_read_unaligned(&head_buf);
        Self::write_node(&block, bucket_count, free_idx, key, value, head)?;
        block.write(bucket_offset, bytemuck::bytes_of(&free_idx))?;
        block.write_pod(0, header)?;
        Ok(())
    }

    fn add_block(storage: &Storage, inner: &mut MapInner, bucket_count: u64) -> Result<usize> {
        let block_idx = inner.blocks.len();
        let mut bucket_count = if bucket_count == 0 {
            match inner.headers.last() {
                Some(last) => last.bucket_count as u64 * 2,
                None => INIT_BUCKET_COUNT,
            }
        } else {
            bucket_count.next_power_of_two()
        };
        if bucket_count * LOAD_FACTOR >= INVALID_NODE_ID as u64 {
            bucket_count = (INVALID_NODE_ID as u64 / LOAD_FACTOR).next_power_of_two() / 2;
        }

        let block_size = Self::block_size(bucket_count);
        let block = storage.append(&data_block_name(block_idx), block_size)?;
        let header = Self::init_block(&block, bucket_count as u32)?;
        inner.blocks.push(block);
        inner.headers.push(header);
        tracing::debug!(bucket_count, "added hash map block");
        Ok(block_idx)
    }

    /// Zeroes and threads a block: empty buckets, all nodes on the free list.
    fn init_block(block: &Block, bucket_count: u32) -> Result<BlockHeader> {
        block.resize(0)?;
        let header = BlockHeader {
            bucket_count,
            node_count: 0,
            free_header: 0,
            reserved: [0; 13],
        };
        block.write_pod(0, &header)?;

        let buckets = vec![0xffu8; bucket_count as usize * 4];
        block.write(std::mem::size_of::<BlockHeader>() as u64, &buckets)?;

        let node_count = bucket_count as u64 * LOAD_FACTOR;
        let mut nodes = vec![0u8; (node_count * Self::node_size()) as usize];
        for i in 0..node_count {
            let next = if i == node_count - 1 {
                INVALID_NODE_ID
            } else {
                (i + 1) as u32
            };
            let at = (i * Self::node_size() + Self::node_size() - 4) as usize;
            nodes[at..at + 4].copy_from_slice(&next.to_le_bytes());
        }
        block.write(
            std::mem::size_of::<BlockHeader>() as u64 + bucket_count as u64 * 4,
            &nodes,
        )?;
        Ok(header)
    }

    fn read_node(block: &Block, bucket_count: u32, node_idx: u32) -> Result<(K, V, u32)> {
        let offset = Self::node_offset(bucket_count, node_idx);
        let buf = block.read_bytes(offset, Self::node_size() as usize)?;
        let key = bytemuck::pod_read_unaligned(&buf[..Self::key_size() as usize]);
        let value = bytemuck::pod_read_unaligned(
            &buf[Self::key_size() as usize..(Self::key_size() + Self::value_size()) as usize],
        );
        let next = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
        Ok((key, value, next))
    }

    fn write_node(
        block: &Block,
        bucket_count: u32,
        node_idx: u32,
        key: &K,
        value: &V,
        next: u32,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(Self::node_size() as usize);
        buf.extend_from_slice(bytemuck::bytes_of(key));
        buf.extend_from_slice(bytemuck::bytes_of(value));
        buf.extend_from_slice(&next.to_le_bytes());
        block.write(Self::node_offset(bucket_count, node_idx), &buf)?;
        Ok(())
    }

    /// Walks blocks newest-first; the first chain hit wins.
    fn find_key(inner: &MapInner, key: &K) -> Result<Option<FoundNode>> {
        let hash = Self::hash(key);
        for block_idx in (0..inner.blocks.len()).rev() {
            let block = &inner.blocks[block_idx];
            let bucket_count = inner.headers[block_idx].bucket_count;
            let bucket_offset = Self::bucket_offset(hash, bucket_count);

            let head_buf = block.read_bytes(bucket_offset, 4)?;
            let mut next: u32 = bytemuck::pod_read_unaligned(&head_buf);
            let mut prev = INVALID_NODE_ID;
            while next != INVALID_NODE_ID {
                let (node_key, _, node_next) = Self::read_node(block, bucket_count, next)?;
                if node_key == *key {
                    return Ok(Some(FoundNode {
                        block_idx,
                        node_idx: next,
                        prev_node_idx: prev,
                        bucket_offset,
                    }));
                }
                prev = next;
                next = node_next;
            }
        }
        Ok(None)
    }
}
