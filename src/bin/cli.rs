// firmfetch - Persistent download queue for telematics devices
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use firmfetch::config::ManagerConfig;
use firmfetch::download::{ConflictPolicy, Download, DownloadManager, QueueDir};
use firmfetch::transport::{CellularHttpClient, SharedLink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "firmfetch-cli")]
#[command(about = "firmfetch CLI - Bench testing tool for the download queue", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the storage root
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a download
    Add {
        /// Source URL (scheme optional)
        #[arg(short, long)]
        url: String,
        /// Destination path on the storage medium
        #[arg(short, long)]
        dest: String,
        /// Priority 1 (none) to 5 (critical)
        #[arg(short, long, default_value_t = 1)]
        priority: u8,
        /// What to do when the destination exists
        #[arg(short, long, value_enum, default_value_t = Flag::NoReplace)]
        flag: Flag,
    },
    /// List the records of every queue directory
    List,
    /// Run the worker until the queue drains or Ctrl-C
    Run {
        /// Logical HTTP client id
        #[arg(short, long, default_value_t = 0)]
        client: u8,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Flag {
    NoReplace,
    Replace,
    Merge,
}

impl From<Flag> for ConflictPolicy {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::NoReplace => ConflictPolicy::NoReplace,
            Flag::Replace => ConflictPolicy::Replace,
            Flag::Merge => ConflictPolicy::Merge,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ManagerConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(root) = cli.root {
        config.database_path = root.join("firmfetch.db");
        config.storage_root = root;
    }

    let transport = Arc::new(CellularHttpClient::new(
        config.max_client_id,
        config.http_timeout(),
        &config.url_scheme,
    )?);
    let link = Arc::new(SharedLink::new(true));
    let manager = DownloadManager::open(config, transport, link).await?;
    manager.begin().await?;

    match cli.command {
        Commands::Add {
            url,
            dest,
            priority,
            flag,
        } => {
            let mut download = Download::new();
            download.initialize(&url, &dest, priority, ConflictPolicy::from(flag).value())?;
            let id = manager.add(&mut download).await?;
            println!("Queued download {} as {}", id, download.storage_key());
        }
        Commands::List => list(&manager).await?,
        Commands::Run { client } => run(&manager, client).await?,
    }

    Ok(())
}

async fn list(manager: &DownloadManager) -> Result<()> {
    let counters = manager.queue().counters().snapshot().await?;
    println!(
        "nextId={} queuedCount={} hasDownload={}",
        counters.next_id, counters.queued_count, counters.has_download_in_progress
    );

    for directory in QueueDir::ALL {
        let records = manager.queue().scan(directory).await?;
        println!("{} ({})", directory, records.len());
        for record in records {
            println!(
                "  {:>6} {:<8} {:>5.1}% {} -> {}",
                record.storage_key(),
                record.status(),
                record.progress_percentage(),
                record.source_url(),
                record.destination_path()
            );
            if let Some(error) = record.last_error() {
                println!("         error 0x{:03X}: {}", error.code, error.message);
            }
        }
    }

    Ok(())
}

async fn run(manager: &DownloadManager, client: u8) -> Result<()> {
    manager.start(client).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                if manager.is_running().await {
                    manager.stop().await?;
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                for download in manager.list_downloads().await {
                    println!(
                        "{:>6} {:<12} {}/{}",
                        download.id(),
                        download.status(),
                        download.downloaded(),
                        download.file_size()
                    );
                }

                if !manager.is_running().await {
                    println!("Worker stopped: {}", manager.get_last_error().await);
                    break;
                }

                let counters = manager.queue().counters().snapshot().await?;
                if counters.queued_count == 0 && !counters.has_download_in_progress {
                    println!("Queue drained");
                    manager.stop().await?;
                    break;
                }
            }
        }
    }

    manager.wait().await;
    Ok(())
}
