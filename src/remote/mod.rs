use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod http_impl;
pub mod mem_impl;

/// The identifier of a point-in-time snapshot that blocks are listed and fetched from.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

/// An opaque, snapshot-scoped and time-bounded credential for fetching one block.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockToken(pub String);

/// One fetchable unit: the block `index` (in units of the block size) and its fetch token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    #[serde(rename = "BlockIndex")]
    pub index: u64,
    #[serde(rename = "BlockToken")]
    pub token: BlockToken,
}

/// A single page of a block listing.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BlockPage {
    #[serde(rename = "Blocks", default)]
    pub blocks: Vec<BlockDescriptor>,
    #[serde(rename = "NextToken", default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub size_gib: u64,
    pub state: VolumeState,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl VolumeInfo {
    pub fn size_bytes(&self) -> u64 {
        self.size_gib * 1024 * 1024 * 1024
    }
}

/// The listing and fetching half of a snapshot API.
#[async_trait::async_trait]
pub trait BlockSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists at most `max_results` blocks, continuing after `page_token` if given.
    async fn list_blocks(
        &self,
        snapshot: &SnapshotId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<BlockPage, Self::Error>;

    async fn fetch_block(
        &self,
        snapshot: &SnapshotId,
        index: u64,
        token: &BlockToken,
    ) -> Result<Bytes, Self::Error>;
}

/// Volume discovery and snapshot lifecycle, on top of block access.
#[async_trait::async_trait]
pub trait SnapshotService: BlockSource {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Self::Error>;

    async fn describe_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>, Self::Error>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<SnapshotId, Self::Error>;

    async fn snapshot_state(&self, snapshot: &SnapshotId) -> Result<SnapshotState, Self::Error>;

    async fn delete_snapshot(&self, snapshot: &SnapshotId) -> Result<(), Self::Error>;
}

mod dbg {
    use super::*;
    use core::fmt;

    impl fmt::Debug for SnapshotId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "SnapshotId({})", self.0)
        }
    }

    impl fmt::Display for SnapshotId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    // tokens are credentials, never print more than a prefix
    impl fmt::Debug for BlockToken {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let prefix: String = self.0.chars().take(6).collect();
            write!(
                f,
                "BlockToken({prefix}{})",
                if prefix.len() < self.0.len() { "…" } else { "" }
            )
        }
    }

    impl fmt::Display for VolumeState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let state: &str = match self {
                Self::Creating => "creating",
                Self::Available => "available",
                Self::InUse => "in-use",
                Self::Deleting => "deleting",
                Self::Deleted => "deleted",
                Self::Error => "error",
                Self::Other(other) => other.as_str(),
            };
            f.write_str(state)
        }
    }
}
