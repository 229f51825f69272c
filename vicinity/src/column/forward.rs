//! Forward store: opaque per-doc payloads addressed by docId.
//!
//! The memory variant keeps variable-length records in chained data blocks
//! with a slot table, local index = docId − min_doc_id. Dumping writes all
//! records into the `ForwardIndex` block of a packed container, which the
//! read-only persist variant serves from.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::format::Packer;
use crate::storage::{Block, FileId, MappedContainer, Snapshot};
use crate::types::{DocId, ReadOptions, SegmentId, INVALID_KEY};

/// Name of the dumped forward block inside a segment container.
pub const FORWARD_DUMP_BLOCK: &str = "ForwardIndex";

const HEADER_BLOCK: &str = "HeaderBlock";
const SLOTS_PER_BLOCK: u64 = 64 * 1024;
const DATA_BLOCK_CAPACITY: u64 = 1024 * 1024;

/// Fixed header carried by every forward record.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ForwardHeader {
    pub primary_key: u64,
    pub timestamp: u64,
    pub revision: u32,
    pub reserved: u32,
    pub lsn: u64,
}

const _: () = assert!(std::mem::size_of::<ForwardHeader>() == 32);

/// One forward record: header plus opaque payload.
#[derive(Debug, Clone)]
pub struct ForwardData {
    pub header: ForwardHeader,
    pub data: Vec<u8>,
}

impl Default for ForwardData {
    fn default() -> Self {
        let mut header = ForwardHeader::zeroed();
        header.primary_key = INVALID_KEY;
        Self {
            header,
            data: Vec::new(),
        }
    }
}

impl ForwardData {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.data.len());
        buf.extend_from_slice(bytemuck::bytes_of(&self.header));
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<ForwardData> {
        if buf.len() < std::mem::size_of::<ForwardHeader>() {
            return Err(Error::ReadData("short forward record".to_string()));
        }
        let header = bytemuck::pod_read_unaligned(&buf[..std::mem::size_of::<ForwardHeader>()]);
        Ok(ForwardData {
            header,
            data: buf[std::mem::size_of::<ForwardHeader>()..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RecordSlot {
    block: u32,
    offset: u32,
    len: u32,
    flags: u32,
}

const SLOT_TOMBSTONE: u32 = 1;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ForwardStoreHeader {
    record_count: u64,
    slot_block_count: u64,
    data_block_count: u64,
    reserved: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<ForwardStoreHeader>() % 64 == 0);

struct ForwardState {
    header: ForwardStoreHeader,
    slot_blocks: Vec<Block>,
    data_blocks: Vec<Block>,
}

/// Writable forward store of one memory segment.
pub struct ForwardIndexer {
    snapshot: Snapshot,
    start_doc_id: DocId,
    header_block: Block,
    state: RwLock<ForwardState>,
}

fn slot_block_name(index: usize) -> String {
    format!("SlotBlock{index}")
}

fn data_block_name(index: usize) -> String {
    format!("DataBlock{index}")
}

impl ForwardIndexer {
    /// Opens `data.fwd.<segment_id>` and mounts the record tables.
    pub fn open(
        dir: &Path,
        segment_id: SegmentId,
        start_doc_id: DocId,
        options: ReadOptions,
    ) -> Result<ForwardIndexer> {
        let snapshot = Snapshot::open_segment(dir, FileId::Forward, segment_id, options)?;
        let storage = snapshot.data().clone();

        let (header_block, state) = match storage.get(HEADER_BLOCK) {
            None => {
                let header_block = storage
                    .append(HEADER_BLOCK, std::mem::size_of::<ForwardStoreHeader>() as u64)?;
                let header = ForwardStoreHeader::zeroed();
                header_block.write_pod(0, &header)?;
                (
                    header_block,
                    ForwardState {
                        header,
                        slot_blocks: Vec::new(),
                        data_blocks: Vec::new(),
                    },
                )
            }
            Some(header_block) => {
                let header: ForwardStoreHeader = header_block.fetch_pod(0)?;
                let mut slot_blocks = Vec::new();
                for i in 0..header.slot_block_count as usize {
                    slot_blocks.push(storage.get(&slot_block_name(i)).ok_or_else(|| {
                        Error::ReadData(format!("missing forward slot block {i}"))
                    })?);
                }
                let mut data_blocks = Vec::new();
                for i in 0..header.data_block_count as usize {
                    data_blocks.push(storage.get(&data_block_name(i)).ok_or_else(|| {
                        Error::ReadData(format!("missing forward data block {i}"))
                    })?);
                }
                (
                    header_block,
                    ForwardState {
                        header,
                        slot_blocks,
                        data_blocks,
                    },
                )
            }
        };

        Ok(ForwardIndexer {
            snapshot,
            start_doc_id,
            header_block,
            state: RwLock::new(state),
        })
    }

    pub fn start_doc_id(&self) -> DocId {
        self.start_doc_id
    }

    pub fn doc_count(&self) -> u64 {
        self.state.read().header.record_count
    }

    pub fn file_path(&self) -> &Path {
        self.snapshot.file_path()
    }

    pub fn file_size(&self) -> u64 {
        self.snapshot.file_size()
    }

    /// Appends a record and returns its docId.
    pub fn insert(&self, forward_data: &ForwardData) -> Result<DocId> {
        let buf = forward_data.serialize();
        let mut state = self.state.write();

        // Records never span data blocks; oversized records get their own.
        let need = buf.len() as u64;
        let tail_ok = state
            .data_blocks
            .last()
            .map(|b| b.padding_size() >= need)
            .unwrap_or(false);
        if !tail_ok {
            let capacity = DATA_BLOCK_CAPACITY.max(need);
            let name = data_block_name(state.header.data_block_count as usize);
            let block = self.snapshot.data().append(&name, capacity)?;
            state.data_blocks.push(block);
            state.header.data_block_count += 1;
        }
        let data_block_idx = state.data_blocks.len() - 1;
        let data_block = state.data_blocks[data_block_idx].clone();
        let offset = data_block.data_size();
        if data_block.write(offset, &buf)? != buf.len() {
            return Err(Error::WriteData("short forward append".to_string()));
        }

        let index = state.header.record_count;
        let slot_block_idx = (index / SLOTS_PER_BLOCK) as usize;
        if slot_block_idx >= state.slot_blocks.len() {
            let name = slot_block_name(slot_block_idx);
            let block = self
                .snapshot
                .data()
                .append(&name, SLOTS_PER_BLOCK * std::mem::size_of::<RecordSlot>() as u64)?;
            state.slot_blocks.push(block);
            state.header.slot_block_count += 1;
        }
        let slot = RecordSlot {
            block: data_block_idx as u32,
            offset: offset as u32,
            len: buf.len() as u32,
            flags: 0,
        };
        let slot_offset = (index % SLOTS_PER_BLOCK) * std::mem::size_of::<RecordSlot>() as u64;
        state.slot_blocks[slot_block_idx].write_pod(slot_offset, &slot)?;

        state.header.record_count += 1;
        self.header_block.write_pod(0, &state.header)?;
        Ok(self.start_doc_id + index)
    }

    fn slot_at(&self, state: &ForwardState, index: u64) -> Result<RecordSlot> {
        let slot_block = &state.slot_blocks[(index / SLOTS_PER_BLOCK) as usize];
        let offset = (index % SLOTS_PER_BLOCK) * std::mem::size_of::<RecordSlot>() as u64;
        slot_block.fetch_pod(offset)
    }

    /// Fetches the record stored under `doc_id`.
    pub fn seek(&self, doc_id: DocId) -> Result<ForwardData> {
        let state = self.state.read();
        let index = doc_id.wrapping_sub(self.start_doc_id);
        if index >= state.header.record_count {
            return Err(Error::ReadData(format!("doc {doc_id} not in forward store")));
        }
        let slot = self.slot_at(&state, index)?;
        if slot.flags & SLOT_TOMBSTONE != 0 {
            return Err(Error::ReadData(format!("doc {doc_id} erased")));
        }
        let buf =
            state.data_blocks[slot.block as usize].read_bytes(slot.offset as u64, slot.len as usize)?;
        ForwardData::deserialize(&buf)
    }

    /// Best-effort tombstone; the delete store stays authoritative.
    pub fn remove(&self, doc_id: DocId) -> Result<()> {
        let state = self.state.write();
        let index = doc_id.wrapping_sub(self.start_doc_id);
        if index >= state.header.record_count {
            return Err(Error::ReadData(format!("doc {doc_id} not in forward store")));
        }
        let mut slot = self.slot_at(&state, index)?;
        slot.flags |= SLOT_TOMBSTONE;
        let slot_block = &state.slot_blocks[(index / SLOTS_PER_BLOCK) as usize];
        let offset = (index % SLOTS_PER_BLOCK) * std::mem::size_of::<RecordSlot>() as u64;
        slot_block.write_pod(offset, &slot)
    }

    /// Writes every record into the `ForwardIndex` block, keeping slot order
    /// so local indices survive the dump.
    pub fn dump<W: Write>(&self, packer: &mut Packer<W>) -> Result<()> {
        let state = self.state.read();
        packer.begin_segment(FORWARD_DUMP_BLOCK)?;
        packer.write(&state.header.record_count.to_le_bytes())?;
        for index in 0..state.header.record_count {
            let slot = self.slot_at(&state, index)?;
            let buf = state.data_blocks[slot.block as usize]
                .read_bytes(slot.offset as u64, slot.len as usize)?;
            packer.write(&slot.len.to_le_bytes())?;
            packer.write(&buf)?;
        }
        packer.end_segment()
    }

    pub fn flush(&self) -> Result<()> {
        self.snapshot.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.snapshot.close()
    }
}

/// Read-only forward store of a persist segment.
pub struct ForwardReader {
    container: Arc<MappedContainer>,
    start_doc_id: DocId,
    /// Per-record `(offset, len)` within the forward block.
    index: Vec<(u32, u32)>,
}

impl ForwardReader {
    pub fn load(container: Arc<MappedContainer>, start_doc_id: DocId) -> Result<ForwardReader> {
        let block = container.block(FORWARD_DUMP_BLOCK)?;
        if block.len() < 8 {
            return Err(Error::ReadData("short forward block".to_string()));
        }
        let count = u64::from_le_bytes(block[..8].try_into().unwrap());

        let mut index = Vec::with_capacity(count as usize);
        let mut offset = 8usize;
        for _ in 0..count {
            if offset + 4 > block.len() {
                return Err(Error::ReadData("truncated forward block".to_string()));
            }
            let len = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
            offset += 4;
            if offset + len as usize > block.len() {
                return Err(Error::ReadData("truncated forward record".to_string()));
            }
            index.push((offset as u32, len));
            offset += len as usize;
        }

        Ok(ForwardReader {
            container,
            start_doc_id,
            index,
        })
    }

    pub fn doc_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn seek(&self, doc_id: DocId) -> Result<ForwardData> {
        let local = doc_id.wrapping_sub(self.start_doc_id);
        let (offset, len) = *self
            .index
            .get(local as usize)
            .ok_or_else(|| Error::ReadData(format!("doc {doc_id} not in forward block")))?;
        let block = self.container.block(FORWARD_DUMP_BLOCK)?;
        ForwardData::deserialize(&block[offset as usize..offset as usize + len as usize])
    }
}
