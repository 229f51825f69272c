//! A snapshot binds a well-known file name to an opened storage.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{ReadOptions, SegmentId};

use super::{FileId, Storage};

/// A named file mapped to a storage; owns open/flush/close.
pub struct Snapshot {
    file_path: PathBuf,
    storage: Storage,
}

impl Snapshot {
    /// Opens `<dir>/<file_id>`.
    pub fn open(dir: &Path, file_id: FileId, options: ReadOptions) -> Result<Snapshot> {
        Self::open_path(file_id.file_path(dir), options)
    }

    /// Opens `<dir>/<file_id>.<segment_id>`.
    pub fn open_segment(
        dir: &Path,
        file_id: FileId,
        segment_id: SegmentId,
        options: ReadOptions,
    ) -> Result<Snapshot> {
        Self::open_path(file_id.segment_file_path(dir, segment_id), options)
    }

    /// Opens `<dir>/<file_id>.<suffix>.<segment_id>`.
    pub fn open_suffixed(
        dir: &Path,
        file_id: FileId,
        suffix: &str,
        segment_id: SegmentId,
        options: ReadOptions,
    ) -> Result<Snapshot> {
        Self::open_path(file_id.suffixed_file_path(dir, suffix, segment_id), options)
    }

    fn open_path(file_path: PathBuf, options: ReadOptions) -> Result<Snapshot> {
        let storage = Storage::open(&file_path, options.use_mmap, options.create_new)?;
        if options.use_mmap && !options.create_new {
            storage.warm_up();
        }
        Ok(Snapshot { file_path, storage })
    }

    pub fn data(&self) -> &Storage {
        &self.storage
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.file_path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_paths() {
        let dir = TempDir::new().unwrap();
        let options = ReadOptions {
            use_mmap: true,
            create_new: true,
        };

        let snapshot = Snapshot::open_suffixed(dir.path(), FileId::Column, "face", 3, options)
            .unwrap();
        assert!(snapshot
            .file_path()
            .to_string_lossy()
            .ends_with("data.pxa.face.3"));
        snapshot.close().unwrap();

        let snapshot = Snapshot::open_segment(dir.path(), FileId::Forward, 7, options).unwrap();
        assert!(snapshot
            .file_path()
            .to_string_lossy()
            .ends_with("data.fwd.7"));
        snapshot.close().unwrap();
        assert!(snapshot.file_size() > 0);
    }
}
