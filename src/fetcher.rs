use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::{BlockFailure, DownloadError};
use crate::lister::Inventory;
use crate::progress::ProgressObserver;
use crate::remote::{BlockDescriptor, BlockSource, SnapshotId};
use crate::volume::{OutputFile, VolumeTarget};

/// The result of one block fetch, `Ok` carrying the number of bytes written.
#[derive(Debug)]
pub struct BlockFetchOutcome {
    pub index: u64,
    pub result: Result<u64, BlockFailure>,
}

impl BlockFetchOutcome {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn bytes_written(&self) -> u64 {
        *self.result.as_ref().unwrap_or(&0)
    }
}

/// The final tally of a fetch phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_written: u64,
    /// Whether the phase stopped submitting blocks because it was cancelled.
    pub cancelled: bool,
}

impl FetchReport {
    fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded == self.total && !self.cancelled
    }

    pub fn resolved(&self) -> u64 {
        self.succeeded + self.failed
    }

    fn record(&mut self, outcome: &BlockFetchOutcome) {
        match &outcome.result {
            Ok(bytes) => {
                self.succeeded += 1;
                self.bytes_written += bytes;
            }
            Err(_) => self.failed += 1,
        }
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} blocks written", self.succeeded, self.total)?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        let skipped = self.total - self.resolved();
        if skipped > 0 {
            write!(f, ", {skipped} not attempted")?;
        }
        Ok(())
    }
}

/// Everything a block task needs, shared between all tasks of one run.
struct Shared<S> {
    source: Arc<S>,
    snapshot: SnapshotId,
    target: VolumeTarget,
    file: OutputFile,
    fetch_timeout: Option<Duration>,
}

impl<S: BlockSource> Shared<S> {
    async fn fetch_one(&self, block: &BlockDescriptor) -> Result<u64, BlockFailure> {
        let range = self.target.block_range(block.index)?;

        let fetch = self
            .source
            .fetch_block(&self.snapshot, block.index, &block.token);
        let fetched = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| BlockFailure::Timeout(limit))?,
            None => fetch.await,
        };
        let data = fetched.map_err(|err| BlockFailure::Fetch(Box::new(err)))?;

        let expected = range.end - range.start;
        let actual = data.len() as u64;
        if actual != expected {
            return Err(BlockFailure::UnexpectedLength { expected, actual });
        }

        self.file
            .write_at(range.start, data)
            .await
            .map_err(BlockFailure::Write)?;
        Ok(actual)
    }
}

/// Fetches every block of an inventory and writes it at its offset in the target file.
///
/// At most `concurrency` blocks are in flight at once. A failing block is
/// reported and skipped, its byte range keeps whatever the file held before.
pub struct BlockFetcher<S> {
    source: Arc<S>,
    snapshot: SnapshotId,
    target: VolumeTarget,
    concurrency: usize,
    fetch_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<S: BlockSource + 'static> BlockFetcher<S> {
    pub fn new(source: Arc<S>, snapshot: SnapshotId, target: VolumeTarget) -> Self {
        Self {
            source,
            snapshot,
            target,
            concurrency: DEFAULT_CONCURRENCY,
            fetch_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Once `cancel` fires, no new blocks are started and in-flight ones are drained.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the fetch phase to completion.
    ///
    /// The target file must already be allocated. Only failing to open it is
    /// an error, individual blocks never fail the run.
    #[instrument(skip_all, fields(snapshot = %self.snapshot, blocks = inventory.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        inventory: &Inventory,
        observer: &dyn ProgressObserver,
    ) -> Result<FetchReport, DownloadError> {
        let file = OutputFile::open(&self.target.path).map_err(|source| {
            DownloadError::Allocation {
                path: self.target.path.clone(),
                source,
            }
        })?;
        let shared = Arc::new(Shared {
            source: Arc::clone(&self.source),
            snapshot: self.snapshot.clone(),
            target: self.target.clone(),
            file: file.clone(),
            fetch_timeout: self.fetch_timeout,
        });

        let mut report = FetchReport::new(inventory.len() as u64);
        observer.on_start(report.total);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut joinset = JoinSet::new();
        let mut pending = inventory.blocks().iter();
        let mut in_flight = HashSet::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !cancelled => {
                    warn!(in_flight = joinset.len(), "cancelled, draining in-flight blocks");
                    cancelled = true;
                }
                Some(joined) = joinset.join_next() => {
                    resolve(joined, &mut in_flight, &mut report, observer);
                }
                permit = semaphore.clone().acquire_owned(), if !cancelled => {
                    let Ok(permit) = permit else { break };
                    let Some(block) = pending.next() else { break };

                    in_flight.insert(block.index);
                    let shared = Arc::clone(&shared);
                    let block = block.clone();
                    joinset.spawn(async move {
                        let result = AssertUnwindSafe(shared.fetch_one(&block))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| Err(BlockFailure::Panicked(panic_message(&*panic))));
                        drop(permit);
                        BlockFetchOutcome { index: block.index, result }
                    });
                }
                else => break,
            }
        }

        while let Some(joined) = joinset.join_next().await {
            resolve(joined, &mut in_flight, &mut report, observer);
        }
        for index in in_flight.drain() {
            let outcome = BlockFetchOutcome {
                index,
                result: Err(BlockFailure::Lost),
            };
            report.record(&outcome);
            observer.on_outcome(&outcome);
        }
        report.cancelled = cancelled;

        file.sync()
            .await
            .map_err(|source| DownloadError::Flush {
                path: self.target.path.clone(),
                source,
            })?;

        if report.is_complete() {
            info!("Downloaded {report}");
        } else {
            warn!("Download incomplete: {report}");
        }
        Ok(report)
    }
}

fn resolve(
    joined: Result<BlockFetchOutcome, JoinError>,
    in_flight: &mut HashSet<u64>,
    report: &mut FetchReport,
    observer: &dyn ProgressObserver,
) {
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(err) => {
            // the block stays in `in_flight` and is reported as lost at the end
            error!(error = %err, "block task failed to join");
            return;
        }
    };
    in_flight.remove(&outcome.index);

    if let Err(err) = &outcome.result {
        debug!(index = outcome.index, error = ?err, "block not written");
    }
    report.record(&outcome);
    observer.on_outcome(&outcome);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}
