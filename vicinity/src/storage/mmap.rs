//! MMap backend: blocks map to contiguous regions of one file; `sync`
//! msyncs the mapping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, Result};

pub(super) struct MmapBuffer {
    file: File,
    map: MmapMut,
    len: u64,
}

impl MmapBuffer {
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Maps an existing file, truncated back to its content region so
    /// appends continue from there.
    pub fn load(path: &Path, content_end: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(content_end)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map,
            len: content_end,
        })
    }

    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.len = new_len;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end > self.map.len() {
            return Err(Error::WriteData("write outside mapping".to_string()));
        }
        self.map[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.map.len() {
            return Err(Error::ReadData("read outside mapping".to_string()));
        }
        buf.copy_from_slice(&self.map[offset as usize..end]);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
