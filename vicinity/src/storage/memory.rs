//! Buffered memory backend: blocks live in one heap buffer, `persist`
//! rewrites the whole file.

use std::path::Path;

use crate::error::{Error, Result};

pub(super) struct MemoryBuffer {
    bytes: Vec<u8>,
}

impl MemoryBuffer {
    pub fn create(len: u64) -> Self {
        Self {
            bytes: vec![0u8; len as usize],
        }
    }

    /// Adopts a file image, dropping the stale meta table and footer past
    /// the content region.
    pub fn load(mut image: Vec<u8>, content_end: u64) -> Self {
        image.truncate(content_end as usize);
        Self { bytes: image }
    }

    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len as usize > self.bytes.len() {
            self.bytes.resize(new_len as usize, 0);
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end > self.bytes.len() {
            return Err(Error::WriteData("write outside buffer".to_string()));
        }
        self.bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.bytes.len() {
            return Err(Error::ReadData("read outside buffer".to_string()));
        }
        buf.copy_from_slice(&self.bytes[offset as usize..end]);
        Ok(())
    }

    pub fn persist(&mut self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}
