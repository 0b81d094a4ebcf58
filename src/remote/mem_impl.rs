use core::fmt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;

use super::*;

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("volume {0} does not exist")]
    VolumeNotFound(String),
    #[error("snapshot {0} does not exist")]
    SnapshotNotFound(SnapshotId),
    #[error("snapshot {0} is not completed yet")]
    SnapshotPending(SnapshotId),
    #[error("block {0} does not exist in the snapshot")]
    BlockNotFound(u64),
    #[error("invalid token for block {0}")]
    InvalidToken(u64),
    #[error("invalid page token {0:?}")]
    InvalidPageToken(String),
    #[error("injected failure fetching block {0}")]
    InjectedFetch(u64),
    #[error("injected listing failure")]
    InjectedListing,
}

type LatencyFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

struct MemVolume {
    info: VolumeInfo,
    blocks: BTreeMap<u64, Bytes>,
}

struct MemSnapshot {
    volume_id: String,
    blocks: BTreeMap<u64, (BlockToken, Bytes)>,
    pending_polls: u32,
}

impl fmt::Debug for MemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemSnapshot")
            .field("volume_id", &self.volume_id)
            .field("blocks", &self.blocks.len())
            .field("pending_polls", &self.pending_polls)
            .finish()
    }
}

#[derive(Default)]
struct State {
    volumes: BTreeMap<String, MemVolume>,
    snapshots: HashMap<SnapshotId, MemSnapshot>,
    deleted_snapshots: Vec<SnapshotId>,

    failing_blocks: HashSet<u64>,
    failing_list_pages: Option<usize>,
    list_calls: usize,
    fetch_calls: usize,
    snapshot_pending_polls: u32,
    snapshot_error: bool,
}

/// An in-memory snapshot service.
///
/// Snapshots copy the block map of their volume at creation time, so later
/// writes to the volume do not show up in an existing snapshot.
#[derive(Default)]
pub struct MemorySnapshotService {
    state: RwLock<State>,
    latency: Option<LatencyFn>,
}

impl fmt::Debug for MemorySnapshotService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("MemorySnapshotService")
            .field("volumes", &state.volumes.keys().collect::<Vec<_>>())
            .field("snapshots", &state.snapshots)
            .finish()
    }
}

impl MemorySnapshotService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every block fetch by the duration returned for the block index.
    pub fn with_fetch_latency(
        mut self,
        latency: impl Fn(u64) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.latency = Some(Arc::new(latency));
        self
    }

    pub fn add_volume(&self, info: VolumeInfo, blocks: impl IntoIterator<Item = (u64, Bytes)>) {
        let volume = MemVolume {
            info,
            blocks: blocks.into_iter().collect(),
        };
        self.write()
            .volumes
            .insert(volume.info.volume_id.clone(), volume);
    }

    /// Creates a completed snapshot directly from raw blocks, bypassing volumes.
    pub fn add_snapshot(&self, blocks: impl IntoIterator<Item = (u64, Bytes)>) -> SnapshotId {
        let snapshot_id = new_snapshot_id();
        let snapshot = MemSnapshot {
            volume_id: String::new(),
            blocks: tokenize(&snapshot_id, blocks),
            pending_polls: 0,
        };
        self.write().snapshots.insert(snapshot_id.clone(), snapshot);
        snapshot_id
    }

    /// Makes every fetch of block `index` fail.
    pub fn fail_block(&self, index: u64) {
        self.write().failing_blocks.insert(index);
    }

    /// Makes the listing fail once `pages` pages have been served.
    pub fn fail_listing_after(&self, pages: usize) {
        self.write().failing_list_pages = Some(pages);
    }

    /// New snapshots report `Pending` for this many polls before completing.
    pub fn set_snapshot_pending_polls(&self, polls: u32) {
        self.write().snapshot_pending_polls = polls;
    }

    /// New snapshots end up in the `Error` state.
    pub fn fail_snapshots(&self) {
        self.write().snapshot_error = true;
    }

    pub fn live_snapshots(&self) -> Vec<SnapshotId> {
        self.read().snapshots.keys().cloned().collect()
    }

    pub fn deleted_snapshots(&self) -> Vec<SnapshotId> {
        self.read().deleted_snapshots.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.read().list_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.read().fetch_calls
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_snapshot_id() -> SnapshotId {
    SnapshotId(format!("snap-{}", uuid::Uuid::new_v4().simple()))
}

fn tokenize(
    snapshot_id: &SnapshotId,
    blocks: impl IntoIterator<Item = (u64, Bytes)>,
) -> BTreeMap<u64, (BlockToken, Bytes)> {
    blocks
        .into_iter()
        .map(|(index, data)| {
            let token = BlockToken(format!("{snapshot_id}:{index}:{}", uuid::Uuid::new_v4()));
            (index, (token, data))
        })
        .collect()
}

#[async_trait::async_trait]
impl BlockSource for MemorySnapshotService {
    type Error = MemError;

    async fn list_blocks(
        &self,
        snapshot: &SnapshotId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<BlockPage, MemError> {
        let mut state = self.write();
        state.list_calls += 1;
        if let Some(pages) = state.failing_list_pages {
            if state.list_calls > pages {
                return Err(MemError::InjectedListing);
            }
        }

        let start = match page_token {
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| MemError::InvalidPageToken(token.into()))?,
            None => 0,
        };
        let snap = state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| MemError::SnapshotNotFound(snapshot.clone()))?;
        if snap.pending_polls > 0 {
            return Err(MemError::SnapshotPending(snapshot.clone()));
        }

        let mut remaining = snap.blocks.range(start..);
        let blocks: Vec<_> = remaining
            .by_ref()
            .take(max_results.max(1) as usize)
            .map(|(index, (token, _))| BlockDescriptor {
                index: *index,
                token: token.clone(),
            })
            .collect();
        let next_token = remaining.next().map(|(index, _)| index.to_string());

        Ok(BlockPage { blocks, next_token })
    }

    async fn fetch_block(
        &self,
        snapshot: &SnapshotId,
        index: u64,
        token: &BlockToken,
    ) -> Result<Bytes, MemError> {
        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(index)).await;
        }

        let mut state = self.write();
        state.fetch_calls += 1;
        if state.failing_blocks.contains(&index) {
            return Err(MemError::InjectedFetch(index));
        }
        let snap = state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| MemError::SnapshotNotFound(snapshot.clone()))?;
        let (expected_token, data) = snap
            .blocks
            .get(&index)
            .ok_or(MemError::BlockNotFound(index))?;
        if expected_token != token {
            return Err(MemError::InvalidToken(index));
        }

        Ok(data.clone())
    }
}

#[async_trait::async_trait]
impl SnapshotService for MemorySnapshotService {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, MemError> {
        let state = self.read();
        Ok(state.volumes.values().map(|v| v.info.clone()).collect())
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>, MemError> {
        let state = self.read();
        Ok(state.volumes.get(volume_id).map(|v| v.info.clone()))
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
    ) -> Result<SnapshotId, MemError> {
        let mut state = self.write();
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| MemError::VolumeNotFound(volume_id.into()))?;

        let snapshot_id = new_snapshot_id();
        let blocks = tokenize(
            &snapshot_id,
            volume.blocks.iter().map(|(i, data)| (*i, data.clone())),
        );
        let pending_polls = state.snapshot_pending_polls;
        state.snapshots.insert(
            snapshot_id.clone(),
            MemSnapshot {
                volume_id: volume_id.into(),
                blocks,
                pending_polls,
            },
        );

        Ok(snapshot_id)
    }

    async fn snapshot_state(&self, snapshot: &SnapshotId) -> Result<SnapshotState, MemError> {
        let mut state = self.write();
        let snapshot_error = state.snapshot_error;
        let snap = state
            .snapshots
            .get_mut(snapshot)
            .ok_or_else(|| MemError::SnapshotNotFound(snapshot.clone()))?;

        if snap.pending_polls > 0 {
            snap.pending_polls -= 1;
            return Ok(SnapshotState::Pending);
        }
        if snapshot_error {
            return Ok(SnapshotState::Error);
        }
        Ok(SnapshotState::Completed)
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotId) -> Result<(), MemError> {
        let mut state = self.write();
        state
            .snapshots
            .remove(snapshot)
            .ok_or_else(|| MemError::SnapshotNotFound(snapshot.clone()))?;
        state.deleted_snapshots.push(snapshot.clone());
        Ok(())
    }
}
