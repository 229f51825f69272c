//! Rolling write-ahead log of `(lsn, context)` pairs.
//!
//! Three fixed blocks: appends toggle between blocks 0 and 1, block 2 holds
//! the shifted-aside log of the last dumped segment. The only consumer is
//! crash recovery, which asks for the highest contiguous-prefix LSN.

use std::collections::BinaryHeap;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::storage::{Block, FileId, Snapshot};
use crate::types::ReadOptions;

use super::{data_block_name, HEADER_BLOCK};

const DATA_BLOCK_COUNT: usize = 3;
const DATA_BLOCK_SIZE: u64 = 1024 * 1024;
/// Entries considered by the contiguity scan.
const WINDOW_SIZE: usize = 2000;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct LsnHeader {
    tail_block_index: u32,
    reserved1: u32,
    lsn_count: u64,
    reserved2: [u64; 6],
}

const _: () = assert!(std::mem::size_of::<LsnHeader>() % 64 == 0);

pub struct LsnStore {
    snapshot: Snapshot,
    header_block: Block,
    data_blocks: Vec<Block>,
    state: RwLock<LsnHeader>,
}

impl LsnStore {
    pub fn open(dir: &Path, options: ReadOptions) -> Result<LsnStore> {
        let snapshot = Snapshot::open(dir, FileId::Lsn, options)?;
        let storage = snapshot.data().clone();

        let (header_block, data_blocks, header) = match storage.get(HEADER_BLOCK) {
            None => {
                let header_block =
                    storage.append(HEADER_BLOCK, std::mem::size_of::<LsnHeader>() as u64)?;
                let header = LsnHeader::zeroed();
                header_block.write_pod(0, &header)?;
                let mut data_blocks = Vec::new();
                for i in 0..DATA_BLOCK_COUNT {
                    data_blocks.push(storage.append(&data_block_name(i), DATA_BLOCK_SIZE)?);
                }
                (header_block, data_blocks, header)
            }
            Some(header_block) => {
                let header: LsnHeader = header_block.fetch_pod(0)?;
                let mut data_blocks = Vec::new();
                for i in 0..DATA_BLOCK_COUNT {
                    let block = storage.get(&data_block_name(i)).ok_or_else(|| {
                        Error::InvalidIndexDataFormat(format!("missing lsn block {i}"))
                    })?;
                    data_blocks.push(block);
                }
                (header_block, data_blocks, header)
            }
        };

        Ok(LsnStore {
            snapshot,
            header_block,
            data_blocks,
            state: RwLock::new(header),
        })
    }

    /// Appends one entry, rotating to the other log block when the tail is
    /// full. An entry larger than a whole block is rejected.
    pub fn append(&self, lsn: u64, lsn_context: &[u8]) -> Result<()> {
        let mut state = self.state.write();

        let entry_len = 8 + 8 + lsn_context.len() as u64;
        if entry_len > DATA_BLOCK_SIZE {
            return Err(Error::ExceedLimit(format!(
                "lsn entry of {entry_len} bytes exceeds block size"
            )));
        }

        let mut block_index = state.tail_block_index as usize;
        let mut block = &self.data_blocks[block_index];
        if block.padding_size() < entry_len {
            block_index = (block_index + 1) % 2;
            block = &self.data_blocks[block_index];
            block.resize(0)?;
            state.tail_block_index = block_index as u32;
            self.header_block.write_pod(0, &*state)?;
        }

        block.write(block.data_size(), &lsn.to_le_bytes())?;
        block.write(block.data_size(), &(lsn_context.len() as u64).to_le_bytes())?;
        if !lsn_context.is_empty() {
            block.write(block.data_size(), lsn_context)?;
        }

        state.lsn_count += 1;
        self.header_block.write_pod(0, &*state)?;
        Ok(())
    }

    /// Copies the current log block aside into block 2, so the toggling
    /// blocks only describe data that is not yet dumped.
    pub fn shift(&self) -> Result<()> {
        let state = self.state.write();

        let mut block_index = state.tail_block_index as usize;
        if self.data_blocks[block_index].data_size() == 0 {
            block_index = (block_index + 1) % 2;
        }
        let src = &self.data_blocks[block_index];
        let live = src.data_size();
        if live == 0 {
            return Err(Error::ReadData("no lsn data to shift".to_string()));
        }

        let data = src.read_bytes(0, live as usize)?;
        let aside = &self.data_blocks[2];
        aside.resize(0)?;
        aside.write(0, &data)?;
        Ok(())
    }

    /// Highest LSN whose smaller neighbors within the window are all
    /// present; the largest seen when no gap exists.
    pub fn get_latest_lsn(&self) -> Result<(u64, Vec<u8>)> {
        let _state = self.state.read();

        // Keep the `WINDOW_SIZE` largest entries.
        let mut window: BinaryHeap<std::cmp::Reverse<(u64, Vec<u8>)>> = BinaryHeap::new();
        for block in &self.data_blocks {
            let data = block.read_bytes(0, block.data_size() as usize)?;
            let mut offset = 0usize;
            while offset + 16 <= data.len() {
                let lsn = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
                let ctx_len =
                    u64::from_le_bytes(data[offset + 8..offset + 16].try_into().unwrap()) as usize;
                offset += 16;
                if offset + ctx_len > data.len() {
                    return Err(Error::ReadData("truncated lsn entry".to_string()));
                }
                let ctx = data[offset..offset + ctx_len].to_vec();
                offset += ctx_len;

                window.push(std::cmp::Reverse((lsn, ctx)));
                if window.len() > WINDOW_SIZE {
                    window.pop();
                }
            }
        }

        let mut entries: Vec<(u64, Vec<u8>)> = window.into_iter().map(|r| r.0).collect();
        entries.sort();
        if entries.is_empty() {
            return Ok((0, Vec::new()));
        }

        for i in 0..entries.len() - 1 {
            if entries[i + 1].0 > entries[i].0 + 1 {
                return Ok(entries[i].clone());
            }
        }
        Ok(entries.last().unwrap().clone())
    }

    pub fn count(&self) -> u64 {
        self.state.read().lsn_count
    }

    pub fn file_path(&self) -> &Path {
        self.snapshot.file_path()
    }

    pub fn file_size(&self) -> u64 {
        self.snapshot.file_size()
    }

    pub fn flush(&self) -> Result<()> {
        self.snapshot.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.snapshot.close()
    }
}
