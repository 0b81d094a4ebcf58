use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use blockpull::remote::mem_impl::MemorySnapshotService;
use blockpull::remote::{BlockPage, BlockSource, BlockToken, SnapshotId};
use blockpull::{allocate, collect_inventory, BlockFetcher, VolumeTarget};
use bytes::Bytes;
use bytesize::ByteSize;
use sketches_ddsketch::DDSketch;

use crate::workload::Workload;

/// Records how long every block fetch takes.
struct TimedSource {
    inner: MemorySnapshotService,
    fetch_durations: Mutex<DDSketch>,
}

#[async_trait::async_trait]
impl BlockSource for TimedSource {
    type Error = <MemorySnapshotService as BlockSource>::Error;

    async fn list_blocks(
        &self,
        snapshot: &SnapshotId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<BlockPage, Self::Error> {
        self.inner.list_blocks(snapshot, max_results, page_token).await
    }

    async fn fetch_block(
        &self,
        snapshot: &SnapshotId,
        index: u64,
        token: &BlockToken,
    ) -> Result<Bytes, Self::Error> {
        let start = Instant::now();
        let result = self.inner.fetch_block(snapshot, index, token).await;
        self.fetch_durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(start.elapsed().as_secs_f64());
        result
    }
}

pub async fn perform_stresstest(workloads: Vec<Workload>) -> Result<()> {
    for workload in workloads {
        let inner = MemorySnapshotService::new().with_fetch_latency(workload.latency_fn());
        let snapshot = inner.add_snapshot(workload.blocks.iter().cloned());
        let source = Arc::new(TimedSource {
            inner,
            fetch_durations: Mutex::new(DDSketch::default()),
        });

        let dir = tempfile::tempdir()?;
        let target = VolumeTarget::new(
            dir.path().join("volume.img"),
            workload.total_size(),
            workload.block_size,
        );
        allocate(&target).await?;
        let inventory = collect_inventory(&*source, &snapshot, 1000).await?;

        let start = Instant::now();
        let report = BlockFetcher::new(Arc::clone(&source), snapshot, target.clone())
            .with_concurrency(workload.concurrency)
            .with_fetch_timeout(None)
            .run(&inventory, &blockpull::progress::NoProgress)
            .await?;
        let elapsed = start.elapsed();

        println!(
            "# Workload {} (concurrency: {})",
            workload.name, workload.concurrency
        );
        println!(
            "  volume {} in {} blocks, {} stored",
            ByteSize::b(workload.total_size()),
            workload.volume_blocks,
            ByteSize::b(workload.stored_bytes())
        );

        let blocks_ps = report.succeeded as f64 / elapsed.as_secs_f64();
        let bytes_ps = (report.bytes_written as f64 / elapsed.as_secs_f64()) as u64;
        println!(
            "=> {report} in {elapsed:.2?}, {blocks_ps:.2} blocks/s, {}/s",
            ByteSize::b(bytes_ps)
        );

        let fetch_durations = std::mem::take(
            &mut *source
                .fetch_durations
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let fetches = fetch_durations.count();
        if fetches > 0 {
            let quantile = |q| {
                let secs = fetch_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = Duration::from_secs_f64(
                fetch_durations.sum().unwrap_or_default() / fetches as f64,
            );
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        if !report.is_complete() {
            bail!("workload {} did not complete: {report}", workload.name);
        }
        let image = tokio::fs::read(&target.path).await?;
        if let Err(index) = workload.verify(&image) {
            bail!("workload {}: block {index} differs", workload.name);
        }
        println!("  image verified");
    }

    Ok(())
}
