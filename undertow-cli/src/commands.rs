//! CLI command implementations

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{spawn_engine, EngineHandle};
use undertow_core::torrent::parsing::{MetainfoParser, TorrentParser};
use undertow_core::TorrentState;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Add a torrent from magnet link or file and run it to completion
    Add {
        /// Magnet link or path to torrent file
        source: String,
        /// Output directory for downloads
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,
    },
    /// Parse a torrent file and print its metadata
    Inspect {
        /// Path to torrent file
        path: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Add {
            source,
            output,
            seed,
        } => add_and_run(source, output, seed).await,
        Commands::Inspect { path } => inspect(path).await,
    }
}

/// Add a torrent and drive the session until it finishes.
async fn add_and_run(source: String, output: Option<PathBuf>, seed: bool) -> anyhow::Result<()> {
    let mut config = UndertowConfig::from_env();
    if let Some(dir) = output {
        config.storage.download_dir = dir;
    }

    let handle = spawn_engine(config);

    let info_hash = if source.starts_with("magnet:") {
        println!("Adding magnet link");
        handle.add_magnet(&source).await?
    } else {
        println!("Adding torrent file: {source}");
        handle.add_torrent_file(PathBuf::from(&source)).await?
    };
    println!("Added torrent: {info_hash}");

    watch(&handle, info_hash, seed).await?;

    handle.shutdown().await.ok();
    Ok(())
}

/// Prints session progress until the torrent reaches a resting state.
async fn watch(
    handle: &EngineHandle,
    info_hash: undertow_core::InfoHash,
    seed: bool,
) -> anyhow::Result<()> {
    let mut last_line = String::new();
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = handle.session(info_hash).await?;

        let line = format!(
            "{:?}: {:.1}% ({} of {} bytes, {} peers, ratio {:.2})",
            snapshot.state,
            snapshot.progress * 100.0,
            snapshot.bytes_have,
            snapshot.total_size,
            snapshot.connected_peers,
            snapshot.ratio,
        );
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
        if let Some(error) = &snapshot.last_error {
            tracing::warn!("session reports: {error}");
        }

        match snapshot.state {
            TorrentState::Seeding if !seed => {
                println!("Download complete.");
                return Ok(());
            }
            TorrentState::Finished => {
                println!("Finished.");
                return Ok(());
            }
            TorrentState::Error { message } => {
                anyhow::bail!("torrent failed: {message}");
            }
            _ => {}
        }
    }
}

/// Parse a torrent file and print its metadata as plain text.
async fn inspect(path: PathBuf) -> anyhow::Result<()> {
    let parser = MetainfoParser::new();
    let metadata = parser
        .parse_torrent_file(&path)
        .await
        .with_context(|| format!("failed to parse {}", path.display()))?;

    println!("Name:          {}", metadata.name);
    println!("Info hash:     {}", metadata.info_hash);
    println!("Total size:    {} bytes", metadata.total_length);
    println!(
        "Pieces:        {} x {} bytes",
        metadata.piece_count(),
        metadata.piece_length
    );
    println!("Files:         {}", metadata.files.len());
    println!("Private:       {}", metadata.private);
    for (index, tier) in metadata.announce_tiers.iter().enumerate() {
        println!("Tier {index}:        {}", tier.join(", "));
    }
    if let Some(comment) = &metadata.comment {
        println!("Comment:       {comment}");
    }
    if let Some(created_by) = &metadata.created_by {
        println!("Created by:    {created_by}");
    }

    Ok(())
}
