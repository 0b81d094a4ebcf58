use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use blockpull::confirm::{Always, Confirm, StdinPrompt};
use blockpull::remote::http_impl::HttpSnapshotService;
use blockpull::remote::{SnapshotService, VolumeInfo};
use blockpull::{DownloadConfig, DownloadError, VolumeDownloader};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

/// Lists block volumes and downloads them as raw disk images.
#[derive(Parser)]
#[clap(version)]
struct Cli {
    #[clap(flatten)]
    remote: RemoteArgs,

    /// Enable debug logging.
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RemoteArgs {
    /// Snapshot gateway endpoint.
    #[clap(long, env = "BLOCKPULL_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    /// Bearer token sent with every request.
    #[clap(long, env = "BLOCKPULL_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Region, e.g. us-east-1. Recorded in the download metadata.
    #[clap(short, long, global = true)]
    region: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// List all volumes.
    List,
    /// Download a volume into a sparse image file.
    Download(DownloadArgs),
}

#[derive(Args)]
struct DownloadArgs {
    volume_id: String,
    /// Output file for the downloaded volume.
    #[clap(short, long, value_name = "FILE")]
    output: PathBuf,
    /// Snapshot the volume even if it is in use.
    #[clap(long)]
    force: bool,
    /// Answer yes to every question.
    #[clap(short, long)]
    yes: bool,
    /// Number of blocks fetched at once.
    #[clap(short = 'j', long)]
    concurrency: Option<usize>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("info,blockpull={level},hyper=warn,reqwest=warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = DownloadConfig::from_env();
    let config = match &cli.remote.region {
        Some(region) => config.with_region(Some(region.clone())),
        None => config,
    };
    let service = HttpSnapshotService::new(
        &cli.remote.endpoint,
        cli.remote.token.clone(),
        config.fetch_timeout,
    )?;

    match cli.command {
        Command::List => {
            list_volumes(&service, config.region.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Download(args) => download(Arc::new(service), config, args).await,
    }
}

async fn list_volumes(service: &HttpSnapshotService, region: Option<&str>) -> Result<()> {
    let in_region = region.map(|r| format!(" in region {r}")).unwrap_or_default();
    info!("Fetching volumes{in_region}");
    let volumes = service
        .list_volumes()
        .await
        .context("failed to list volumes")?;

    if volumes.is_empty() {
        println!("No volumes found{in_region}");
        return Ok(());
    }

    println!("Found {} volumes{in_region}:", volumes.len());
    print!("{}", volume_table(&volumes));
    Ok(())
}

fn truncate(value: &str) -> String {
    if value.chars().count() > 18 {
        let head: String = value.chars().take(18).collect();
        format!("{head}...")
    } else {
        value.into()
    }
}

fn volume_table(volumes: &[VolumeInfo]) -> String {
    let rule = "-".repeat(120);
    let mut table = format!(
        "{rule}\n{:<25} {:<20} {:<10} {:<10} {:<10} {:<20} {:<20}\n{rule}\n",
        "Volume ID", "Name", "Size (GB)", "State", "Type", "Instance ID", "Instance Name"
    );

    for volume in volumes {
        let attachment = volume.attachments.first();
        let instance_id = attachment.map_or("N/A", |a| a.instance_id.as_str());
        let instance_name = attachment
            .and_then(|a| a.instance_name.as_deref())
            .unwrap_or("N/A");
        table.push_str(&format!(
            "{:<25} {:<20} {:<10} {:<10} {:<10} {:<20} {:<20}\n",
            volume.volume_id,
            truncate(volume.name.as_deref().unwrap_or("N/A")),
            volume.size_gib,
            volume.state.to_string(),
            volume.volume_type.as_deref().unwrap_or("N/A"),
            instance_id,
            truncate(instance_name),
        ));
    }

    table.push_str(&rule);
    table.push('\n');
    table
}

async fn download(
    service: Arc<HttpSnapshotService>,
    config: DownloadConfig,
    args: DownloadArgs,
) -> Result<ExitCode> {
    let confirm: Box<dyn Confirm> = if args.yes {
        Box::new(Always(true))
    } else {
        Box::new(StdinPrompt)
    };

    if args.output.exists() {
        let question = format!("File {} already exists. Overwrite?", args.output.display());
        if !tokio::task::block_in_place(|| confirm.confirm(&question)) {
            info!("Download cancelled");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let config = match args.concurrency {
        Some(concurrency) => config.with_concurrency(concurrency),
        None => config,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupted, cleaning up. Press Ctrl-C again to abort immediately");
            cancel.cancel();

            // the signal handler stays installed, so a second Ctrl-C has to end the process
            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Aborted, the snapshot may have to be deleted manually");
                std::process::exit(130);
            }
        }
    });

    let downloader = VolumeDownloader::new(service, config)
        .with_confirm(confirm)
        .with_force(args.force)
        .with_cancellation(cancel);

    info!(
        "Downloading volume {} to {}",
        args.volume_id,
        args.output.display()
    );
    match downloader.download(&args.volume_id, &args.output).await {
        Ok(summary) if summary.report.is_complete() => {
            info!(
                "Volume {} downloaded successfully to {}",
                summary.volume_id,
                summary.output.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(summary) => {
            warn!(
                "Volume {} downloaded incompletely: {}",
                summary.volume_id, summary.report
            );
            Ok(ExitCode::from(2))
        }
        Err(DownloadError::Declined) => {
            info!("Download cancelled");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!("Failed to download volume {}", args.volume_id);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use blockpull::remote::{Attachment, VolumeState};

    use super::*;

    #[test]
    fn test_truncates_long_names() {
        assert_eq!(truncate("short"), "short");
        assert_eq!(truncate("exactly-eighteen-c"), "exactly-eighteen-c");
        assert_eq!(
            truncate("a-rather-long-volume-name"),
            "a-rather-long-volu..."
        );
    }

    #[test]
    fn test_table_rows() {
        let volumes = [
            VolumeInfo {
                volume_id: "vol-1".into(),
                name: Some("data".into()),
                size_gib: 8,
                state: VolumeState::InUse,
                volume_type: Some("gp3".into()),
                attachments: vec![Attachment {
                    instance_id: "i-1".into(),
                    instance_name: None,
                }],
            },
            VolumeInfo {
                volume_id: "vol-2".into(),
                name: None,
                size_gib: 1,
                state: VolumeState::Available,
                volume_type: None,
                attachments: vec![],
            },
        ];

        let table = volume_table(&volumes);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[1].starts_with("Volume ID"));
        assert!(lines[3].starts_with("vol-1"));
        assert!(lines[3].contains("in-use"));
        assert!(lines[3].contains("i-1"));
        assert!(lines[3].trim_end().ends_with("N/A"));
        assert_eq!(lines[4].matches("N/A").count(), 4);
    }
}
