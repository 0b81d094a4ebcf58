use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{BlockFailure, DownloadError};

/// The local file a volume is reassembled into.
///
/// Both sizes are fixed before any block is fetched, and the file length never
/// changes after [`allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTarget {
    pub path: PathBuf,
    pub total_size: u64,
    pub block_size: u64,
}

impl VolumeTarget {
    pub fn new(path: impl Into<PathBuf>, total_size: u64, block_size: u64) -> Self {
        Self {
            path: path.into(),
            total_size,
            block_size: block_size.max(1),
        }
    }

    /// The number of blocks covering the volume, counting a trailing partial block.
    pub fn block_count(&self) -> u64 {
        self.total_size.div_ceil(self.block_size)
    }

    /// The byte range block `index` occupies in the file, clipped to the volume end.
    ///
    /// Ranges of distinct indices never overlap.
    pub fn block_range(&self, index: u64) -> Result<Range<u64>, BlockFailure> {
        let offset = index
            .checked_mul(self.block_size)
            .filter(|offset| *offset < self.total_size)
            .ok_or(BlockFailure::OutOfBounds {
                offset: index.saturating_mul(self.block_size),
            })?;
        let end = (offset + self.block_size).min(self.total_size);
        Ok(offset..end)
    }
}

/// Creates (or truncates) the target file and extends it to `total_size`
/// without writing any data, leaving a sparse file where supported.
#[instrument(skip_all, fields(path = %target.path.display(), size = target.total_size))]
pub async fn allocate(target: &VolumeTarget) -> Result<(), DownloadError> {
    let to_error = |source| DownloadError::Allocation {
        path: target.path.clone(),
        source,
    };

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&target.path)
        .await
        .map_err(to_error)?;
    file.set_len(target.total_size).await.map_err(to_error)?;
    file.sync_all().await.map_err(to_error)?;

    debug!("allocated output file");
    Ok(())
}

/// A shared handle to an allocated output file that only supports positioned writes.
///
/// Every write names its offset explicitly, so concurrent writers never share a cursor.
#[derive(Debug, Clone)]
pub struct OutputFile {
    file: Arc<File>,
}

impl OutputFile {
    /// Opens an already allocated file, without creating or truncating it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    pub async fn write_at(&self, offset: u64, data: bytes::Bytes) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
            .await
            .map_err(io::Error::other)?
    }

    pub async fn sync(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_block_ranges() {
        let target = VolumeTarget::new("unused", 10, 4);
        assert_eq!(target.block_count(), 3);
        assert_eq!(target.block_range(0).unwrap(), 0..4);
        assert_eq!(target.block_range(1).unwrap(), 4..8);
        // the trailing block is clipped to the volume end
        assert_eq!(target.block_range(2).unwrap(), 8..10);
        assert!(matches!(
            target.block_range(3),
            Err(BlockFailure::OutOfBounds { offset: 12 })
        ));
        assert!(matches!(
            target.block_range(u64::MAX),
            Err(BlockFailure::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_block_ranges_are_disjoint() {
        let target = VolumeTarget::new("unused", 1000 * 7 + 3, 7);
        let ranges: Vec<_> = (0..target.block_count())
            .map(|i| target.block_range(i).unwrap())
            .collect();
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(ranges.last().unwrap().end, target.total_size);
    }

    #[tokio::test]
    async fn test_allocate_sizes() {
        let dir = tempfile::tempdir().unwrap();
        for size in [0, 1, 4, 11, 512 * 1024 + 17] {
            let target = VolumeTarget::new(dir.path().join(format!("vol-{size}")), size, 4);
            allocate(&target).await.unwrap();

            let metadata = std::fs::metadata(&target.path).unwrap();
            assert_eq!(metadata.len(), size);
            let contents = std::fs::read(&target.path).unwrap();
            assert!(contents.iter().all(|b| *b == 0));
        }
    }

    #[tokio::test]
    async fn test_allocate_truncates_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol");
        std::fs::write(&path, b"previous download contents").unwrap();

        let target = VolumeTarget::new(&path, 8, 4);
        allocate(&target).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), [0; 8]);
    }

    #[tokio::test]
    async fn test_allocate_fails_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = VolumeTarget::new(dir.path().join("missing/vol"), 8, 4);
        let err = allocate(&target).await.unwrap_err();
        assert!(matches!(err, DownloadError::Allocation { .. }));
    }

    #[tokio::test]
    async fn test_positioned_writes() {
        let dir = tempfile::tempdir().unwrap();
        let target = VolumeTarget::new(dir.path().join("vol"), 12, 4);
        allocate(&target).await.unwrap();

        let file = OutputFile::open(&target.path).unwrap();
        file.write_at(8, Bytes::from_static(b"CCCC")).await.unwrap();
        file.write_at(0, Bytes::from_static(b"AAAA")).await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(std::fs::read(&target.path).unwrap(), b"AAAA\0\0\0\0CCCC");
    }

    #[test]
    fn test_open_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OutputFile::open(&dir.path().join("missing")).is_err());
    }
}
