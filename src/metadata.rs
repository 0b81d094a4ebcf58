use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// A description of a downloaded volume, stored next to the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub volume_id: String,
    pub volume_name: Option<String>,
    pub volume_size_gb: u64,
    pub region: Option<String>,
    pub download_date: DateTime<Local>,
    pub block_count: u64,
    pub block_size: u64,
    pub blocks_written: u64,
    pub complete: bool,
}

/// `disk.img` → `disk.img.metadata.json`
pub fn metadata_path(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(".metadata.json");
    path.into()
}

impl DownloadMetadata {
    pub async fn write(&self, path: &Path) -> Result<(), DownloadError> {
        let to_error = |source| DownloadError::Metadata {
            path: path.into(),
            source,
        };
        let json = serde_json::to_vec_pretty(self).map_err(|err| to_error(err.into()))?;
        tokio::fs::write(path, json).await.map_err(to_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_a_sibling() {
        assert_eq!(
            metadata_path(Path::new("/tmp/vol.img")),
            Path::new("/tmp/vol.img.metadata.json")
        );
        assert_eq!(
            metadata_path(Path::new("vol")),
            Path::new("vol.metadata.json")
        );
    }

    #[tokio::test]
    async fn test_write_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = metadata_path(&dir.path().join("vol.img"));
        let metadata = DownloadMetadata {
            volume_id: "vol-1".into(),
            volume_name: Some("data".into()),
            volume_size_gb: 8,
            region: None,
            download_date: Local::now(),
            block_count: 3,
            block_size: 512 * 1024,
            blocks_written: 3,
            complete: true,
        };
        metadata.write(&path).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["volume_id"], "vol-1");
        assert_eq!(json["volume_name"], "data");
        assert_eq!(json["region"], serde_json::Value::Null);
        assert_eq!(json["block_count"], 3);
        assert_eq!(json["block_size"], 524288);

        let read_back: DownloadMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(read_back, metadata);
    }
}
