use std::time::Duration;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let workloads = [1, 10, 50]
        .into_iter()
        .map(|concurrency| {
            Workload::builder("sparse-volume")
                .seed(0x5eed)
                .concurrency(concurrency)
                .volume(2048, 64 * 1024)
                .occupancy(0.4)
                .latency_distribution(Duration::from_millis(2), Duration::from_millis(40))
                .build()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    perform_stresstest(workloads).await
}
