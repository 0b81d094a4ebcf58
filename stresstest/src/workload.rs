use std::thread::available_parallelism;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal};

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    block_size: u64,
    volume_blocks: u64,
    occupancy: f64,

    p50_latency: Duration,
    p99_latency: Duration,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn volume(mut self, blocks: u64, block_size: u64) -> Self {
        self.volume_blocks = blocks;
        self.block_size = block_size;
        self
    }

    /// The share of blocks that hold data, the rest are holes.
    pub fn occupancy(mut self, occupancy: f64) -> Self {
        self.occupancy = occupancy.clamp(0.0, 1.0);
        self
    }

    pub fn latency_distribution(mut self, p50: Duration, p99: Duration) -> Self {
        self.p50_latency = p50;
        self.p99_latency = p99;
        self
    }

    pub fn build(self) -> Result<Workload> {
        let mut rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_latency.as_secs_f64();
        let p99 = self.p99_latency.as_secs_f64();
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;
        let latency = LogNormal::new(mu, sigma).context("invalid latency distribution")?;

        let mut blocks = vec![];
        for index in 0..self.volume_blocks {
            if !rng.gen_bool(self.occupancy) {
                continue;
            }
            let mut data = vec![0; self.block_size as usize];
            rng.fill_bytes(&mut data);
            blocks.push((index, Bytes::from(data)));
        }

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            seed: self.seed,
            block_size: self.block_size,
            volume_blocks: self.volume_blocks,
            blocks,
            latency,
        })
    }
}

/// A synthetic sparse volume, with a deterministic fetch latency per block.
pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    seed: u64,

    pub block_size: u64,
    pub volume_blocks: u64,
    /// The blocks holding data, in index order.
    pub blocks: Vec<(u64, Bytes)>,
    latency: LogNormal<f64>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map_or(1, |n| n.get()),
            seed: rand::random(),

            block_size: 64 * 1024,
            volume_blocks: 1024,
            occupancy: 0.5,

            p50_latency: Duration::from_millis(5),
            p99_latency: Duration::from_millis(50),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.volume_blocks * self.block_size
    }

    pub fn stored_bytes(&self) -> u64 {
        self.blocks.len() as u64 * self.block_size
    }

    /// The simulated fetch latency, the same every time for a given block.
    pub fn latency_fn(&self) -> impl Fn(u64) -> Duration + Send + Sync + 'static {
        let seed = self.seed;
        let latency = self.latency;
        move |index| {
            let mut rng = SmallRng::seed_from_u64(seed ^ index);
            Duration::from_secs_f64(latency.sample(&mut rng))
        }
    }

    /// Checks a reassembled image, returning the first block that differs.
    pub fn verify(&self, image: &[u8]) -> Result<(), u64> {
        if image.len() as u64 != self.total_size() {
            return Err(image.len() as u64 / self.block_size);
        }

        let mut stored = self.blocks.iter().peekable();
        for (index, chunk) in image.chunks(self.block_size as usize).enumerate() {
            let index = index as u64;
            let matches = match stored.next_if(|(i, _)| *i == index) {
                Some((_, data)) => chunk == &data[..],
                None => chunk.iter().all(|b| *b == 0),
            };
            if !matches {
                return Err(index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lognormal_percentiles_work() {
        let workload = Workload::builder("test")
            .seed(7)
            .latency_distribution(Duration::from_millis(10), Duration::from_millis(100))
            .build()
            .unwrap();
        let latency = workload.latency_fn();

        let mut latencies: Vec<_> = (0..1000).map(&latency).collect();
        latencies.sort_unstable();

        assert_eq!(latency(3), latency(3));
        assert!(latencies[500] > Duration::from_millis(5));
        assert!(latencies[500] < Duration::from_millis(20));
    }

    #[test]
    fn test_sparse_volume() {
        let workload = Workload::builder("test")
            .seed(1)
            .volume(100, 16)
            .occupancy(0.3)
            .build()
            .unwrap();
        assert!(!workload.blocks.is_empty() && workload.blocks.len() < 100);
        assert!(workload.blocks.iter().all(|(i, data)| *i < 100 && data.len() == 16));

        let mut image = vec![0; workload.total_size() as usize];
        for (index, data) in &workload.blocks {
            let offset = (*index * 16) as usize;
            image[offset..offset + 16].copy_from_slice(data);
        }
        assert_eq!(workload.verify(&image), Ok(()));

        let (first, _) = workload.blocks[0];
        image[(first * 16) as usize] ^= 0xff;
        assert_eq!(workload.verify(&image), Err(first));
    }
}
