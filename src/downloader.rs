use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::DownloadConfig;
use crate::confirm::{Always, Confirm};
use crate::error::DownloadError;
use crate::fetcher::{BlockFetcher, FetchReport};
use crate::lister::collect_inventory;
use crate::metadata::{metadata_path, DownloadMetadata};
use crate::progress::ProgressAccountant;
use crate::remote::{SnapshotId, SnapshotService, SnapshotState, VolumeInfo, VolumeState};
use crate::volume::{allocate, VolumeTarget};

#[derive(Debug)]
pub struct DownloadSummary {
    pub volume_id: String,
    pub snapshot_id: SnapshotId,
    pub output: PathBuf,
    pub metadata_path: PathBuf,
    pub report: FetchReport,
}

/// Downloads whole volumes through a transient snapshot.
pub struct VolumeDownloader<C> {
    service: Arc<C>,
    config: DownloadConfig,
    confirm: Arc<dyn Confirm>,
    force: bool,
    cancel: CancellationToken,
}

impl<C: SnapshotService + 'static> VolumeDownloader<C> {
    pub fn new(service: Arc<C>, config: DownloadConfig) -> Self {
        Self {
            service,
            config,
            confirm: Arc::new(Always(false)),
            force: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Asked before snapshotting a volume that is in use.
    pub fn with_confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Arc::new(confirm);
        self
    }

    /// Snapshot in-use volumes without asking.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Snapshots `volume_id` and reassembles it into `output`.
    ///
    /// An existing `output` is overwritten. The snapshot is deleted again
    /// whether or not the download succeeds. A download with failed blocks is
    /// not an error, check [`FetchReport::is_complete`].
    #[instrument(skip(self, output), fields(output = %output.display()))]
    pub async fn download(
        &self,
        volume_id: &str,
        output: &Path,
    ) -> Result<DownloadSummary, DownloadError> {
        let volume = self.check_volume(volume_id).await?;

        info!("Creating snapshot of volume {volume_id}");
        let description = format!("Snapshot for download of {volume_id}");
        let snapshot = self
            .service
            .create_snapshot(volume_id, &description)
            .await
            .map_err(|err| DownloadError::remote("create snapshot", err))?;
        info!("Snapshot {snapshot} created, waiting for completion");

        let result = self.download_snapshot(&volume, &snapshot, output).await;
        self.delete_snapshot(&snapshot).await;
        result
    }

    async fn check_volume(&self, volume_id: &str) -> Result<VolumeInfo, DownloadError> {
        info!("Checking volume {volume_id}");
        let volume = self
            .service
            .describe_volume(volume_id)
            .await
            .map_err(|err| DownloadError::remote("describe volume", err))?
            .ok_or_else(|| DownloadError::VolumeNotFound(volume_id.into()))?;

        let label = match &volume.name {
            Some(name) => format!("{volume_id} ({name})"),
            None => volume_id.into(),
        };
        info!(
            "Found volume {label} ({} GB, {})",
            volume.size_gib, volume.state
        );

        if volume.state == VolumeState::InUse {
            if self.force {
                info!("Volume {volume_id} is in use, proceeding because of --force");
            } else {
                warn!("Volume {volume_id} is currently in use. Snapshotting an in-use volume");
                warn!("may result in an inconsistent state if there are active writes to it.");
                if !self.ask("Do you want to continue anyway?").await {
                    info!("Download declined");
                    return Err(DownloadError::Declined);
                }
            }
        }

        Ok(volume)
    }

    /// Asks on a blocking thread, since a prompt may wait on stdin.
    async fn ask(&self, question: &'static str) -> bool {
        let confirm = Arc::clone(&self.confirm);
        match tokio::task::spawn_blocking(move || confirm.confirm(question)).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "confirmation prompt failed");
                false
            }
        }
    }

    async fn wait_for_snapshot(&self, snapshot: &SnapshotId) -> Result<(), DownloadError> {
        let attempts = self.config.snapshot_wait_attempts;
        for attempt in 1..=attempts {
            let state = self
                .service
                .snapshot_state(snapshot)
                .await
                .map_err(|err| DownloadError::remote("describe snapshot", err))?;
            debug!(attempt, ?state, "polled snapshot");

            match state {
                SnapshotState::Completed => {
                    info!("Snapshot {snapshot} completed");
                    return Ok(());
                }
                SnapshotState::Error => return Err(DownloadError::SnapshotFailed(snapshot.clone())),
                SnapshotState::Pending if attempt == attempts => break,
                SnapshotState::Pending => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.snapshot_poll_interval) => {}
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }

        Err(DownloadError::SnapshotTimeout {
            snapshot: snapshot.clone(),
            attempts,
        })
    }

    async fn download_snapshot(
        &self,
        volume: &VolumeInfo,
        snapshot: &SnapshotId,
        output: &Path,
    ) -> Result<DownloadSummary, DownloadError> {
        self.wait_for_snapshot(snapshot).await?;

        let target = VolumeTarget::new(output, volume.size_bytes(), self.config.block_size);
        info!("Creating output file of size {} GB", volume.size_gib);
        allocate(&target).await?;

        info!("Listing all blocks in the snapshot");
        let inventory = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            inventory = collect_inventory(&*self.service, snapshot, self.config.page_size) => inventory?,
        };
        info!("Found {} blocks to download", inventory.len());

        let accountant = ProgressAccountant::new();
        let report = BlockFetcher::new(Arc::clone(&self.service), snapshot.clone(), target)
            .with_concurrency(self.config.concurrency)
            .with_fetch_timeout(self.config.fetch_timeout)
            .with_cancellation(self.cancel.clone())
            .run(&inventory, &accountant)
            .await?;

        let metadata = DownloadMetadata {
            volume_id: volume.volume_id.clone(),
            volume_name: volume.name.clone(),
            volume_size_gb: volume.size_gib,
            region: self.config.region.clone(),
            download_date: Local::now(),
            block_count: report.total,
            block_size: self.config.block_size,
            blocks_written: report.succeeded,
            complete: report.is_complete(),
        };
        let metadata_path = metadata_path(output);
        metadata.write(&metadata_path).await?;
        info!("Metadata saved to {}", metadata_path.display());

        Ok(DownloadSummary {
            volume_id: volume.volume_id.clone(),
            snapshot_id: snapshot.clone(),
            output: output.into(),
            metadata_path,
            report,
        })
    }

    /// Best-effort, a failure here never replaces the download result.
    async fn delete_snapshot(&self, snapshot: &SnapshotId) {
        info!("Cleaning up snapshot {snapshot}");
        match self.service.delete_snapshot(snapshot).await {
            Ok(()) => info!("Snapshot {snapshot} deleted"),
            Err(err) => warn!(error = ?err, "failed to delete snapshot {snapshot}, delete it manually"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom};
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::remote::mem_impl::MemorySnapshotService;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn volume(id: &str, state: VolumeState) -> VolumeInfo {
        VolumeInfo {
            volume_id: id.into(),
            name: Some("test-data".into()),
            size_gib: 1,
            state,
            volume_type: Some("gp3".into()),
            attachments: vec![],
        }
    }

    fn config() -> DownloadConfig {
        DownloadConfig::default()
            .with_block_size(4)
            .with_page_size(2)
            .with_snapshot_polling(Duration::from_millis(1), 5)
    }

    fn service_with(state: VolumeState) -> Arc<MemorySnapshotService> {
        let service = MemorySnapshotService::new();
        service.add_volume(
            volume("vol-1", state),
            [
                (0, Bytes::from_static(b"AAAA")),
                (2, Bytes::from_static(b"CCCC")),
                (3, Bytes::from_static(b"DDDD")),
            ],
        );
        Arc::new(service)
    }

    fn read_head(path: &Path, len: usize) -> Vec<u8> {
        let mut file = std::fs::File::open(path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut head = vec![0; len];
        file.read_exact(&mut head).unwrap();
        head
    }

    #[tokio::test]
    async fn test_download_volume() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("vol.img");
        let service = service_with(VolumeState::Available);
        service.set_snapshot_pending_polls(2);

        let downloader = VolumeDownloader::new(Arc::clone(&service), config());
        let summary = downloader.download("vol-1", &output).await.unwrap();

        assert_eq!(summary.report.succeeded, 3);
        assert!(summary.report.is_complete());
        assert_eq!(std::fs::metadata(&output).unwrap().len(), GIB);
        assert_eq!(read_head(&output, 20), b"AAAA\0\0\0\0CCCCDDDD\0\0\0\0");

        let metadata: DownloadMetadata =
            serde_json::from_slice(&std::fs::read(&summary.metadata_path).unwrap()).unwrap();
        assert_eq!(metadata.volume_name.as_deref(), Some("test-data"));
        assert_eq!(metadata.block_count, 3);
        assert_eq!(metadata.blocks_written, 3);
        assert!(metadata.complete);

        assert!(service.live_snapshots().is_empty());
        assert_eq!(service.deleted_snapshots(), [summary.snapshot_id]);
    }

    #[tokio::test]
    async fn test_in_use_volume_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("vol.img");
        let service = service_with(VolumeState::InUse);

        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &output)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Declined));
        assert!(service.deleted_snapshots().is_empty());
        assert!(!output.exists());

        VolumeDownloader::new(Arc::clone(&service), config())
            .with_confirm(Always(true))
            .download("vol-1", &output)
            .await
            .unwrap();

        VolumeDownloader::new(Arc::clone(&service), config())
            .with_force(true)
            .download("vol-1", &output)
            .await
            .unwrap();
        assert_eq!(service.deleted_snapshots().len(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_runs_off_the_runtime_thread() {
        struct RecordThread(std::sync::Mutex<Option<std::thread::ThreadId>>);

        impl Confirm for RecordThread {
            fn confirm(&self, _question: &str) -> bool {
                *self.0.lock().unwrap() = Some(std::thread::current().id());
                false
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let service = service_with(VolumeState::InUse);
        let record = Arc::new(RecordThread(Default::default()));

        let err = VolumeDownloader::new(service, config())
            .with_confirm(Arc::clone(&record))
            .download("vol-1", &dir.path().join("vol.img"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Declined));
        let asked_on = record.0.lock().unwrap().unwrap();
        assert_ne!(asked_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_missing_volume() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(VolumeState::Available);

        let err = VolumeDownloader::new(service, config())
            .download("vol-404", &dir.path().join("vol.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::VolumeNotFound(id) if id == "vol-404"));
    }

    #[tokio::test]
    async fn test_snapshot_is_deleted_after_fatal_errors() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("vol.img");

        let service = service_with(VolumeState::Available);
        service.fail_listing_after(1);
        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &output)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Listing(_)));
        assert_eq!(service.deleted_snapshots().len(), 1);
        assert!(service.live_snapshots().is_empty());

        let service = service_with(VolumeState::Available);
        service.fail_snapshots();
        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &output)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::SnapshotFailed(_)));
        assert!(service.live_snapshots().is_empty());

        let service = service_with(VolumeState::Available);
        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &dir.path().join("missing/vol.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Allocation { .. }));
        assert!(service.live_snapshots().is_empty());
        assert_eq!(service.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(VolumeState::Available);
        service.set_snapshot_pending_polls(100);

        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &dir.path().join("vol.img"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::SnapshotTimeout { attempts: 5, .. }
        ));
        assert!(service.live_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(VolumeState::Available);
        service.set_snapshot_pending_polls(100);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = VolumeDownloader::new(Arc::clone(&service), config())
            .with_cancellation(cancel)
            .download("vol-1", &dir.path().join("vol.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert!(service.live_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_listing() {
        let dir = tempfile::tempdir().unwrap();
        let service = MemorySnapshotService::new();
        service.add_volume(
            volume("vol-1", VolumeState::Available),
            (0..50).map(|i| (i, Bytes::from_static(b"AAAA"))),
        );
        let service = Arc::new(service);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = VolumeDownloader::new(Arc::clone(&service), config().with_page_size(1))
            .with_cancellation(cancel)
            .download("vol-1", &dir.path().join("vol.img"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(service.list_calls(), 0);
        assert_eq!(service.fetch_calls(), 0);
        assert!(service.live_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_download_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("vol.img");
        let service = service_with(VolumeState::Available);
        service.fail_block(2);

        let summary = VolumeDownloader::new(Arc::clone(&service), config())
            .download("vol-1", &output)
            .await
            .unwrap();

        assert_eq!((summary.report.succeeded, summary.report.total), (2, 3));
        assert!(!summary.report.is_complete());
        assert_eq!(read_head(&output, 16), b"AAAA\0\0\0\0\0\0\0\0DDDD");

        let metadata: DownloadMetadata =
            serde_json::from_slice(&std::fs::read(&summary.metadata_path).unwrap()).unwrap();
        assert!(!metadata.complete);
        assert_eq!(metadata.blocks_written, 2);
        assert!(service.live_snapshots().is_empty());
    }
}
