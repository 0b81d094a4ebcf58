use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// The fixed block size of snapshot blocks, 512 KiB.
pub const BLOCK_SIZE: u64 = 512 * 1024;

/// The maximum number of blocks a single listing request may return.
pub const MAX_PAGE_SIZE: u32 = 1000;

pub const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_WAIT_ATTEMPTS: u32 = 40;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub block_size: u64,
    pub page_size: u32,
    pub concurrency: usize,
    /// Upper bound for a single block fetch, `None` leaves it to the transport.
    pub fetch_timeout: Option<Duration>,
    pub snapshot_poll_interval: Duration,
    pub snapshot_wait_attempts: u32,
    pub region: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            page_size: MAX_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            snapshot_poll_interval: DEFAULT_POLL_INTERVAL,
            snapshot_wait_attempts: DEFAULT_WAIT_ATTEMPTS,
            region: None,
        }
    }
}

impl DownloadConfig {
    /// The default configuration, overlaid with `BLOCKPULL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(concurrency) = parse_var::<usize>(&lookup, "BLOCKPULL_CONCURRENCY") {
            config = config.with_concurrency(concurrency);
        }
        if let Some(page_size) = parse_var::<u32>(&lookup, "BLOCKPULL_PAGE_SIZE") {
            config = config.with_page_size(page_size);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BLOCKPULL_FETCH_TIMEOUT_SECS") {
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            config = config.with_fetch_timeout(timeout);
        }
        if let Some(region) = lookup("BLOCKPULL_REGION").filter(|r| !r.is_empty()) {
            config.region = Some(region);
        }

        config
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Sets the listing page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_snapshot_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.snapshot_poll_interval = interval;
        self.snapshot_wait_attempts = attempts.max(1);
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "ignoring unparsable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DownloadConfig::from_lookup(lookup(&[]));
        assert_eq!(config.block_size, 512 * 1024);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.region, None);
    }

    #[test]
    fn test_env_overrides_are_validated() {
        let config = DownloadConfig::from_lookup(lookup(&[
            ("BLOCKPULL_CONCURRENCY", "0"),
            ("BLOCKPULL_PAGE_SIZE", "5000"),
            ("BLOCKPULL_FETCH_TIMEOUT_SECS", "0"),
            ("BLOCKPULL_REGION", "eu-west-1"),
        ]));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.fetch_timeout, None);
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));

        let config = DownloadConfig::from_lookup(lookup(&[
            ("BLOCKPULL_CONCURRENCY", "lots"),
            ("BLOCKPULL_FETCH_TIMEOUT_SECS", " 5 "),
        ]));
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(5)));
    }
}
