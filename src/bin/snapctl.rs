//! SnapFS administration tool.
//!
//! Formats volumes and drives the snapshot lifecycle: create, take,
//! enable, disable, delete, list.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

use snapfs::format::{self, iflags, MkfsParams};
use snapfs::modules::snapshot::{control, lifecycle};
use snapfs::{FileBackedBlockDevice, Volume, BLOCK_SIZE};

/// SnapFS - writable-snapshot layer administration
#[derive(Parser)]
#[command(
    name = "snapctl",
    about = "SnapFS snapshot administration",
    version = env!("CARGO_PKG_VERSION"),
    author = "SnapFS Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a device with SnapFS
    Format {
        /// Device or image file path
        device: PathBuf,

        /// Size in MiB (images are created at this size)
        #[arg(short, long, default_value_t = 64)]
        size: u64,

        /// Volume name
        #[arg(short, long)]
        name: Option<String>,

        /// Journal size in blocks
        #[arg(long, default_value_t = 64)]
        journal_blocks: u32,
    },

    /// Manage snapshots on a formatted device
    Snapshot {
        /// Device or image file path
        device: PathBuf,

        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Create a snapshot and capture the volume into it
    Take,

    /// List all snapshots on the chain
    List,

    /// Enable a snapshot (make it loop mountable)
    Enable {
        /// Snapshot inode number
        ino: u32,
    },

    /// Disable a snapshot
    Disable {
        /// Snapshot inode number
        ino: u32,
    },

    /// Mark a snapshot deleted; reclamation happens in the background pass
    Delete {
        /// Snapshot inode number
        ino: u32,
    },

    /// Show chain statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(log_level).init();

    match cli.command {
        Commands::Format {
            device,
            size,
            name,
            journal_blocks,
        } => {
            let dev = if device.exists() {
                FileBackedBlockDevice::open(&device, false).await?
            } else {
                FileBackedBlockDevice::create(&device, size * 1024 * 1024).await?
            };
            let params = MkfsParams {
                journal_blocks,
                volume_name: name,
                ..Default::default()
            };
            let layout = format::mkfs(&dev, &params).await?;
            println!(
                "formatted {}: {} blocks in {} group(s)",
                device.display(),
                layout.block_count,
                layout.group_count
            );
        }

        Commands::Snapshot { device, command } => {
            let dev = Arc::new(FileBackedBlockDevice::open(&device, false).await?);
            let vol = Volume::mount(dev, false).await?;
            let result = run_snapshot_command(&vol, command).await;
            vol.unmount().await?;
            result?;
        }
    }

    Ok(())
}

async fn run_snapshot_command(vol: &Volume, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Take => {
            let ino = lifecycle::create_snapshot_file(vol).await?;
            lifecycle::snapshot_create(vol, ino).await?;
            lifecycle::snapshot_take(vol, ino).await?;
            info!("snapshot {} taken", ino);
            println!("snapshot {} taken (id {})", ino, vol.superblock().snapshot_id);
        }

        SnapshotCommands::List => {
            let chain = vol.snapshots().snapshot_list();
            if chain.is_empty() {
                println!("no snapshots");
                return Ok(());
            }
            println!("{:<8} {:<6} {:<12} {:<10} FLAGS", "INODE", "ID", "SIZE", "BLOCKS");
            for ino in chain {
                let h = vol.get_inode(ino).await?;
                let flags = control::get_flags(vol, ino).await?;
                let (disksize, blocks, id) = h.with(|i| (i.disksize, i.blocks, i.generation));
                println!(
                    "{:<8} {:<6} {:<12} {:<10} {}",
                    ino,
                    id,
                    format_bytes(disksize),
                    blocks,
                    format_flags(flags)
                );
            }
        }

        SnapshotCommands::Enable { ino } => {
            let flags = control::get_flags(vol, ino).await?;
            control::set_flags(vol, ino, flags | iflags::ENABLED).await?;
            println!("snapshot {} enabled", ino);
        }

        SnapshotCommands::Disable { ino } => {
            let flags = control::get_flags(vol, ino).await?;
            control::set_flags(vol, ino, flags & !iflags::ENABLED).await?;
            println!("snapshot {} disabled", ino);
        }

        SnapshotCommands::Delete { ino } => {
            let flags = control::get_flags(vol, ino).await?;
            control::set_flags(vol, ino, (flags & !iflags::ENABLED) | iflags::DELETED).await?;
            println!("snapshot {} deleted", ino);
        }

        SnapshotCommands::Stats => {
            let sb = vol.superblock();
            println!("Snapshot statistics:");
            println!("  snapshots on chain:  {}", vol.snapshots().len());
            println!("  last snapshot id:    {}", sb.snapshot_id);
            println!("  active snapshot ino: {}", sb.active_snapshot_ino);
            println!(
                "  free space:          {}",
                format_bytes(sb.free_blocks as u64 * BLOCK_SIZE as u64)
            );
            println!(
                "  reserved for take:   {}",
                format_bytes(sb.snapshot_reserved_blocks as u64 * BLOCK_SIZE as u64)
            );
        }
    }

    Ok(())
}

fn format_flags(flags: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (iflags::ON_LIST, "list"),
        (iflags::ACTIVE, "active"),
        (iflags::ENABLED, "enabled"),
        (iflags::IN_USE, "in-use"),
        (iflags::DELETED, "deleted"),
        (iflags::SHRUNK, "shrunk"),
        (iflags::OPEN, "open"),
    ] {
        if flags & bit != 0 {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);
        }
    }
    if out.is_empty() {
        out.push('-');
    }
    out
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
