use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filebay::{
    config::Config,
    services::{ThumbnailService, TranscodingService, TrashService},
};
use sandboxed_roots::RootSet;

#[derive(Parser)]
#[command(name = "filebay")]
#[command(version)]
#[command(about = "Personal file-manager backend: thumbnails, transcodes, trash")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or fetch from cache) a thumbnail for a file
    Thumbnail {
        path: String,
        /// Size variant name from the config
        #[arg(short, long, default_value = "thumb")]
        size: String,
        /// Write the JPEG here instead of reporting its size
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Produce (or fetch from cache) a browser-playable MP4
    Transcode { path: String },
    /// Resolve a user path against the configured roots
    Resolve { path: String },
    /// Trash operations
    #[command(subcommand)]
    Trash(TrashCommand),
    /// Remove every cached thumbnail and transcode
    CacheClear,
}

#[derive(Subcommand)]
enum TrashCommand {
    /// Move paths to the trash
    Put { paths: Vec<String> },
    /// List trash contents
    List,
    /// Restore items by id
    Restore { ids: Vec<String> },
    /// Permanently delete items by id
    Rm { ids: Vec<String> },
    /// Permanently delete everything in the trash
    Empty,
    /// Show entry count and total size
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load_from_file(&cli.config)?;

    // Each component is constructed once here and passed down explicitly; no
    // ambient globals.
    let roots = Arc::new(RootSet::new(
        &config.storage.root_path,
        config.storage.mounts.clone(),
    )?);
    info!("Root set initialized: {}", roots.primary().display());

    let thumbnails = ThumbnailService::new(&config.thumbnails, &config.tools)?;
    let transcoding = TranscodingService::new(&config.transcoding, &config.tools)?;
    let trash = TrashService::new(roots.clone());
    info!("Services initialized");

    match cli.command {
        Command::Thumbnail { path, size, output } => {
            let resolved = roots.resolve(&path)?;
            match thumbnails.get_thumbnail(&resolved, &size).await? {
                Some(bytes) => match output {
                    Some(out) => {
                        tokio::fs::write(&out, &bytes).await?;
                        println!("{}", out.display());
                    }
                    None => println!("{} bytes of JPEG", bytes.len()),
                },
                None => println!("no thumbnail available"),
            }
        }
        Command::Transcode { path } => {
            let resolved = roots.resolve(&path)?;
            match transcoding.get_or_create_mp4(&resolved).await? {
                Some(cached) => println!("{}", cached.display()),
                None => println!("no transcode available"),
            }
        }
        Command::Resolve { path } => {
            let resolved = roots.resolve(&path)?;
            println!("{} -> {}", roots.relativize(&resolved), resolved.display());
        }
        Command::Trash(op) => run_trash(&trash, op).await?,
        Command::CacheClear => {
            let thumbs = thumbnails.cache().clear().await?;
            let videos = transcoding.cache().clear().await?;
            println!("removed {thumbs} thumbnails, {videos} transcodes");
        }
    }

    Ok(())
}

async fn run_trash(trash: &TrashService, op: TrashCommand) -> Result<()> {
    match op {
        TrashCommand::Put { paths } => {
            println!("moved {} items to trash", trash.move_to_trash(&paths).await?);
        }
        TrashCommand::List => {
            for item in trash.list_trash().await {
                println!(
                    "{}  {}  ({} bytes, deleted {})",
                    item.name, item.original_path, item.size, item.deleted_at
                );
            }
        }
        TrashCommand::Restore { ids } => {
            println!("restored {} items", trash.restore(&ids).await?);
        }
        TrashCommand::Rm { ids } => {
            println!("deleted {} items", trash.delete_permanent(&ids).await?);
        }
        TrashCommand::Empty => {
            println!("deleted {} items", trash.empty_trash().await?);
        }
        TrashCommand::Info => {
            let info = trash.get_info().await;
            println!("{} items, {} bytes", info.count, info.size);
        }
    }
    Ok(())
}
