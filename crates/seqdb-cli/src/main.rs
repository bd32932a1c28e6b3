//! # seqdb-atlas CLI
//!
//! Troubleshooting front end for the shared memory atlas: fetch ranges,
//! sweep whole volumes under a memory budget and dump region layouts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seqdb_atlas::{Atlas, AtlasStats, Lease, LockHold};
use seqdb_config::logging::{init_logging, LogLevel};
use seqdb_config::{
    log_atlas_debug, log_atlas_warn, log_cli_debug, log_cli_info, log_gc_info, parse_size, Config,
};

mod dump;

/// Shared memory atlas for flat-file sequence databases
#[derive(Parser)]
#[command(name = "seqdb-atlas")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Read through buffered I/O instead of memory mapping
    #[arg(long, global = true)]
    no_mmap: bool,

    /// Resident-byte budget (accepts K/M/G suffixes)
    #[arg(long, global = true, value_name = "SIZE", value_parser = parse_bytes)]
    memory_bound: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch bytes [BEGIN, END) of a file through the atlas
    Read {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// First byte offset
        begin: u64,

        /// One past the last byte offset
        end: u64,

        /// Print a hex dump instead of raw text
        #[arg(long)]
        hex: bool,
    },

    /// Sweep a file in chunks through a lease and report atlas statistics
    Scan {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Bytes per request
        #[arg(long, default_value = "64K", value_parser = parse_bytes)]
        chunk: u64,

        /// Distance between request starts (defaults to the chunk size)
        #[arg(long, value_parser = parse_bytes)]
        stride: Option<u64>,
    },

    /// Map each file whole and print the region layout as JSON
    Layout {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_bytes(value: &str) -> Result<u64, String> {
    parse_size(value).ok_or_else(|| format!("invalid size: {value}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let config = effective_config(&cli)?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Read {
            file,
            begin,
            end,
            hex,
        } => {
            let atlas = open_atlas(&config)?;
            cmd_read(&atlas, &file, begin, end, hex)
        }
        Commands::Scan {
            file,
            chunk,
            stride,
        } => {
            let atlas = open_atlas(&config)?;
            cmd_scan(&atlas, &file, chunk, stride.unwrap_or(chunk))
        }
        Commands::Layout { files } => {
            let atlas = open_atlas(&config)?;
            cmd_layout(&atlas, &files)
        }
    }
}

/// Global config with command-line flags applied on top
fn effective_config(cli: &Cli) -> Result<Config> {
    let mut config = seqdb_config::config().clone();
    if cli.no_mmap {
        config.atlas.use_mmap = false;
    }
    if let Some(bound) = cli.memory_bound {
        config.atlas.memory_bound = bound;
    }
    config.atlas.validate().context("Invalid atlas configuration")?;
    Ok(config)
}

fn open_atlas(config: &Config) -> Result<Atlas> {
    let atlas = Atlas::new(config.atlas.to_options()).context("Failed to create atlas")?;
    log_atlas_debug!(
        "Atlas ready",
        backend = atlas.backend_name(),
        memory_bound = config.atlas.memory_bound
    );
    Ok(atlas)
}

/// Mapping was requested but some regions had to be read into memory
fn warn_on_fallback(atlas: &Atlas, stats: &AtlasStats) {
    if atlas.options().use_mmap && stats.owned_regions > 0 {
        log_atlas_warn!(
            "Mapping failed for some regions, served from buffered reads",
            owned = stats.owned_regions,
            mapped = stats.mapped_regions
        );
    }
}

fn cmd_read(atlas: &Atlas, file: &Path, begin: u64, end: u64, hex: bool) -> Result<()> {
    let mut hold = atlas.hold();
    let bytes = atlas
        .get_region(file, begin, end, &mut hold)
        .with_context(|| format!("Failed to read {} [{begin}, {end})", file.display()))?;

    if hex {
        print!("{}", dump::hex_dump(&bytes, begin));
    } else {
        println!("{}", String::from_utf8_lossy(&bytes));
    }

    let layout = atlas.layout(&mut hold);
    atlas.ret_region(bytes, &mut hold)?;

    eprintln!();
    for region in &layout {
        eprintln!("  {}", dump::describe_region(region));
    }
    Ok(())
}

fn cmd_scan(atlas: &Atlas, file: &Path, chunk: u64, stride: u64) -> Result<()> {
    anyhow::ensure!(chunk > 0 && stride > 0, "chunk and stride must be non-zero");

    let length = atlas
        .file_size(file)
        .with_context(|| format!("Failed to stat {}", file.display()))?;
    log_cli_info!(
        "Scanning",
        path = tracing::field::display(file.display()),
        length = length,
        chunk = chunk,
        stride = stride
    );

    let mut lease = Lease::new();
    let mut hold = atlas.hold();
    let mut checksum = 0u64;
    let mut scanned = 0u64;
    let mut peak = 0u64;

    let mut begin = 0;
    while begin < length {
        let end = begin.saturating_add(chunk).min(length);
        atlas
            .lease_region(&mut lease, file, begin, end, &mut hold)
            .with_context(|| format!("Failed to read {} [{begin}, {end})", file.display()))?;

        if let Some(bytes) = lease.slice(begin, end) {
            checksum = bytes
                .iter()
                .fold(checksum, |acc, b| acc.rotate_left(5) ^ u64::from(*b));
            scanned += bytes.len() as u64;
        }
        peak = peak.max(atlas.resident_bytes(&mut hold));
        begin = begin.saturating_add(stride);
    }

    atlas.ret_lease(&mut lease, &mut hold)?;
    let stats = atlas.stats(&mut hold);
    log_cli_debug!("Scan finished", requests = stats.hits + stats.misses);
    warn_on_fallback(atlas, &stats);

    let evicted = atlas.garbage_collect(&mut hold);
    log_gc_info!("Released idle regions", evicted = evicted);

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "path": file,
            "length": length,
            "scanned": scanned,
            "checksum": format!("{checksum:016x}"),
            "peak_resident": peak,
            "stats": stats,
        }))?
    );
    Ok(())
}

fn cmd_layout(atlas: &Atlas, files: &[PathBuf]) -> Result<()> {
    let mut hold = atlas.hold();
    let mut held = Vec::with_capacity(files.len());

    let result = map_all(atlas, files, &mut held, &mut hold);
    let layout = atlas.layout(&mut hold);
    warn_on_fallback(atlas, &atlas.stats(&mut hold));
    for bytes in held {
        atlas.ret_region(bytes, &mut hold)?;
    }
    result?;

    atlas.show_layout(&mut hold);
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}

fn map_all(
    atlas: &Atlas,
    files: &[PathBuf],
    held: &mut Vec<seqdb_atlas::RegionBytes>,
    hold: &mut LockHold<'_>,
) -> Result<()> {
    for file in files {
        let bytes = atlas
            .get_file(file, hold)
            .with_context(|| format!("Failed to map {}", file.display()))?;
        held.push(bytes);
    }
    Ok(())
}
