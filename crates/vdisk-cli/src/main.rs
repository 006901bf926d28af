//! vdisk CLI - Create, inspect and export sparse virtual-disk images.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use vdisk_core::{
    create_sparse_disk, export_raw, is_sparse_extent, AccessMode, CreateOptions, Disk,
    ExportOptions, ExportProgress, ExtentStats,
};

/// Tool for creating and inspecting sparse virtual-disk images.
#[derive(Parser)]
#[command(name = "vdisk")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display information about a disk image.
    Info {
        /// Path to the image (descriptor file or monolithic sparse).
        image: PathBuf,
    },

    /// Create a new monolithic sparse disk image.
    Create {
        /// Path for the new image.
        image: PathBuf,

        /// Capacity, e.g. 512M, 8G, or a plain byte count.
        #[arg(short, long)]
        size: String,
    },

    /// Export a disk image as a raw image.
    Export {
        /// Path to the source image.
        image: PathBuf,

        /// Output raw image path.
        output: PathBuf,

        /// Chunk size in megabytes for streaming.
        #[arg(long, default_value = "4")]
        chunk_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { image } => show_info(&image)?,
        Commands::Create { image, size } => run_create(&image, &size)?,
        Commands::Export {
            image,
            output,
            chunk_size,
            quiet,
        } => run_export(&image, &output, chunk_size, quiet)?,
    }

    Ok(())
}

fn show_info(image: &std::path::Path) -> Result<()> {
    let disk = Disk::open(image, AccessMode::ReadOnly)
        .with_context(|| format!("failed to open {}", image.display()))?;

    let descriptor = disk.descriptor().clone();
    println!("Disk Information");
    println!("================");
    println!();
    println!("Create type: {}", descriptor.create_type.as_str());
    println!("Content id:  {:08x}", descriptor.content_id);
    println!("Capacity:    {}", format_bytes(disk.len_bytes()));
    println!(
        "Geometry:    {} cylinders, {} heads, {} sectors/track",
        descriptor.geometry.cylinders, descriptor.geometry.heads, descriptor.geometry.sectors
    );
    println!("Sparse:      {}", if disk.is_sparse() { "yes" } else { "no" });
    println!();

    println!("Extents:");
    for (i, extent) in descriptor.extents.iter().enumerate() {
        println!(
            "  {}. {} {} {} {}",
            i + 1,
            extent.access.as_str(),
            format_bytes(extent.size_sectors * 512),
            extent.kind.as_str(),
            extent.backing.as_deref().unwrap_or("-")
        );
    }

    // Storage-efficiency details for sparse images
    if is_sparse_extent(image)? {
        let stats = ExtentStats::scan(image)?;
        println!();
        println!(
            "Allocation:  {} of {} grains ({:.1}% occupied)",
            stats.allocated_grains,
            stats.total_grains,
            stats.occupancy() * 100.0
        );
        println!(
            "Stored:      {} data, {} metadata, {} on disk",
            format_bytes(stats.stored_bytes),
            format_bytes(stats.overhead_bytes),
            format_bytes(stats.file_bytes)
        );
    }

    Ok(())
}

fn run_create(image: &std::path::Path, size: &str) -> Result<()> {
    let capacity = parse_size(size)?;
    let descriptor = create_sparse_disk(image, capacity, &CreateOptions::default())
        .with_context(|| format!("failed to create {}", image.display()))?;

    println!(
        "Created {} ({}, content id {:08x})",
        image.display(),
        format_bytes(descriptor.disk_size_bytes()),
        descriptor.content_id
    );
    Ok(())
}

fn run_export(
    image: &std::path::Path,
    output: &std::path::Path,
    chunk_size_mb: usize,
    quiet: bool,
) -> Result<()> {
    let mut disk = Disk::open(image, AccessMode::ReadOnly)
        .with_context(|| format!("failed to open {}", image.display()))?;
    let total = disk.len_bytes();

    if !quiet {
        println!("Exporting {} -> {}", image.display(), output.display());
        println!("Capacity: {}", format_bytes(total));
    }

    let progress_bar: Option<Arc<Mutex<ProgressBar>>> = if quiet {
        None
    } else {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(Arc::new(Mutex::new(pb)))
    };

    let callback: Option<vdisk_core::ProgressCallback> =
        if let Some(pb_arc) = progress_bar.clone() {
            Some(Box::new(move |progress: ExportProgress| {
                let pb = pb_arc.lock().unwrap();
                pb.set_position(progress.bytes_processed);
            }))
        } else {
            None
        };

    let writer = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let options = ExportOptions {
        chunk_size: chunk_size_mb * 1024 * 1024,
    };
    let (_, summary) = export_raw(disk.content(), writer, &options, callback)?;

    if let Some(pb_arc) = progress_bar {
        pb_arc.lock().unwrap().finish();
    }

    if !quiet {
        println!();
        println!("Wrote {}", format_bytes(summary.bytes_written));
        println!("SHA-256: {}", summary.sha256_hex());
    }

    Ok(())
}

/// Parse a size like "512M", "8G" or a plain byte count.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty size");
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('T') | Some('t') => (&s[..s.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size: {}", s))?;
    value
        .checked_mul(multiplier)
        .context("size overflows 64 bits")
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
