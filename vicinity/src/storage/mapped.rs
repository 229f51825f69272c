//! Read-only view over a packed container file, used by persist segments.

use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::format::{UnpackedSegment, Unpacker};

use std::collections::HashMap;

enum ContainerData {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl ContainerData {
    fn bytes(&self) -> &[u8] {
        match self {
            ContainerData::Mapped(map) => map,
            ContainerData::Buffered(buf) => buf,
        }
    }
}

/// An immutable, fully validated container image.
pub struct MappedContainer {
    path: PathBuf,
    data: ContainerData,
    segments: HashMap<String, UnpackedSegment>,
    version: String,
}

impl MappedContainer {
    /// Opens and validates `path`, including the content checksum.
    pub fn open(path: &Path, use_mmap: bool) -> Result<MappedContainer> {
        let data = if use_mmap {
            let file = std::fs::File::open(path)?;
            ContainerData::Mapped(unsafe { Mmap::map(&file)? })
        } else {
            ContainerData::Buffered(std::fs::read(path)?)
        };

        let unpacker = Unpacker::unpack(data.bytes(), true)?;
        let segments = unpacker.segments().clone();
        let version = unpacker.version().to_string();
        Ok(MappedContainer {
            path: path.to_path_buf(),
            data,
            segments,
            version,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.segments.contains_key(name)
    }

    /// Data bytes of a named block.
    pub fn block(&self, name: &str) -> Result<&[u8]> {
        let segment = self
            .segments
            .get(name)
            .ok_or_else(|| Error::ReadData(format!("missing container block {name}")))?;
        let start = segment.data_offset as usize;
        Ok(&self.data.bytes()[start..start + segment.data_size as usize])
    }

    pub fn file_size(&self) -> u64 {
        self.data.bytes().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Packer;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_read_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.seg.0");

        let file = std::fs::File::create(&path).unwrap();
        let mut packer = Packer::new(std::io::BufWriter::new(file));
        packer.setup().unwrap();
        packer.pack_segment("ForwardIndex", b"records").unwrap();
        packer.finish(0).unwrap();

        for use_mmap in [true, false] {
            let container = MappedContainer::open(&path, use_mmap).unwrap();
            assert_eq!(container.block("ForwardIndex").unwrap(), b"records");
            assert!(container.has_block("IndexVersion"));
            assert!(container.block("Nope").is_err());
        }
    }
}
