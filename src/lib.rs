//! Downloads a block volume by fetching the blocks of one of its snapshots in
//! parallel and writing each at its offset into a sparse local image.

pub mod config;
pub mod confirm;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod lister;
pub mod metadata;
pub mod progress;
pub mod remote;
pub mod volume;

pub use config::DownloadConfig;
pub use downloader::{DownloadSummary, VolumeDownloader};
pub use error::{BlockFailure, DownloadError};
pub use fetcher::{BlockFetchOutcome, BlockFetcher, FetchReport};
pub use lister::{collect_inventory, list_blocks, Inventory};
pub use volume::{allocate, VolumeTarget};
