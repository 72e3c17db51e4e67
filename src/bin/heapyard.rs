//! heapyard command-line interface
//!
//! # Examples
//!
//! ```bash
//! # Import files with four worker processes
//! heapyard dispatch --cache-dir cache --workers 4 parts/*.step
//!
//! # Import on the calling thread only
//! heapyard dispatch --cache-dir cache --local assembly.step
//!
//! # Exercise every heap configuration
//! heapyard heap-stats --objects 2000 --object-size 512
//! ```

use clap::{Args, Parser, Subcommand};
use heapyard::allocator::{all_heap_configs, AllocatorSubsystem, HeapConfig, SegregatedHeap};
use heapyard::dispatcher::{
    protocol, CacheFileProcessor, Dispatcher, FileDescriptor, ImportParameters, Mesher,
};
use heapyard::HeapyardConfig;
use std::io;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// heapyard - segregated heap page configurations and a CAD import dispatcher
#[derive(Parser, Debug)]
#[command(name = "heapyard")]
#[command(version = heapyard::VERSION)]
#[command(about = "Segregated heap page configurations and a CAD import dispatcher", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "HEAPYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "HEAPYARD_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import CAD files through the dispatcher
    Dispatch(DispatchArgs),

    /// Serve the worker protocol on stdin/stdout
    Worker,

    /// Exercise every heap configuration and print allocator statistics
    HeapStats(HeapStatsArgs),

    /// Print the effective configuration
    ShowConfig,

    /// Show version
    Version,
}

/// Dispatch arguments
#[derive(Args, Debug)]
struct DispatchArgs {
    /// Directory receiving scene-graph and geometry cache files
    #[arg(long)]
    cache_dir: PathBuf,

    /// Number of worker processes (overrides the configuration)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process every file on this thread instead of worker processes
    #[arg(long)]
    local: bool,

    /// Tessellation backend
    #[arg(long, default_value = "cad-kernel")]
    mesher: Mesher,

    /// Import parameters as JSON
    #[arg(long)]
    import_parameters: Option<String>,

    /// Files to import
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

/// Heap exercise arguments
#[derive(Args, Debug)]
struct HeapStatsArgs {
    /// Objects to allocate per configuration
    #[arg(long, default_value = "1000")]
    objects: usize,

    /// Object size in bytes
    #[arg(long, default_value = "256")]
    object_size: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol in worker mode
    let worker_mode = matches!(cli.command, Commands::Worker);
    setup_logging(&cli, worker_mode)?;

    let config = HeapyardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Dispatch(args) => dispatch_command(config, args),
        Commands::Worker => worker_command(),
        Commands::HeapStats(args) => heap_stats_command(config, args),
        Commands::ShowConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("heapyard {}", heapyard::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli, worker_mode: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_name = if worker_mode {
        "heapyard-worker.log"
    } else {
        "heapyard.log"
    };
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, file_name);

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let console = if worker_mode {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::stdout)
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(console)
                .with_ansi(!cli.no_color && !worker_mode),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Dispatch command - import files
fn dispatch_command(config: HeapyardConfig, args: DispatchArgs) -> anyhow::Result<()> {
    let mut import_parameters = match &args.import_parameters {
        Some(json) => serde_json::from_str::<ImportParameters>(json)?,
        None => ImportParameters::default(),
    };
    import_parameters.mesher = args.mesher;

    std::fs::create_dir_all(&args.cache_dir)?;
    let mut dispatcher =
        Dispatcher::new(import_parameters, args.cache_dir.clone(), config.dispatcher);
    if let Some(workers) = args.workers {
        dispatcher.set_worker_count(workers);
    }

    for file in &args.files {
        let path = std::fs::canonicalize(file).unwrap_or_else(|_| file.clone());
        if dispatcher
            .add_task(FileDescriptor::new(path), args.mesher)
            .is_none()
        {
            info!(file = %file.display(), "Skipping duplicate file");
        }
    }

    let summary = match dispatcher.process(!args.local) {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Dispatch failed");
            return Err(e.into());
        }
    };

    println!("Dispatch summary:");
    println!("  Tasks:          {}", summary.total);
    println!("  Succeeded:      {}", summary.succeeded);
    println!("  Failed:         {}", summary.failed);
    println!("  File not found: {}", summary.file_not_found);
    println!("  Workers:        {}", summary.workers_spawned);
    println!(
        "  Duration:       {} ms",
        (summary.finished_at - summary.started_at).num_milliseconds()
    );

    let file_map = dispatcher.file_map();
    if !file_map.is_empty() {
        println!("\nCache files:");
        println!("{}", serde_json::to_string_pretty(&file_map)?);
    }

    Ok(())
}

/// Worker command - serve the dispatcher protocol
fn worker_command() -> anyhow::Result<()> {
    info!(pid = std::process::id(), "Worker ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    protocol::serve(&mut stdin.lock(), &mut stdout.lock(), &CacheFileProcessor::new())?;
    Ok(())
}

/// Heap stats command - allocate and free through every configuration
fn heap_stats_command(config: HeapyardConfig, args: HeapStatsArgs) -> anyhow::Result<()> {
    let subsystem = AllocatorSubsystem::with_system_memory(config.allocator);

    println!("Heap configurations:");
    for heap_config in all_heap_configs(&subsystem) {
        println!(
            "  {:<28} page {:>7} B  header {:>4} B  payload offset {:>4} B",
            heap_config.name(),
            heap_config.page_size(),
            heap_config.header_size(),
            heap_config.payload_offset()
        );
    }

    println!("\nExercise ({} objects of {} B):", args.objects, args.object_size);
    exercise(subsystem.outline_medium_config(), &args)?;
    exercise(subsystem.inline_medium_config(), &args)?;

    let stats = subsystem.stats();
    println!("\nReservation:");
    println!("  Reserved:    {} B", stats.reservation.reserved_bytes);
    println!("  Allocated:   {} B", stats.reservation.allocated_bytes);
    println!("  Free:        {} B", stats.reservation.free_bytes);
    println!("  Chunks:      {}", stats.reservation.chunk_count);
    println!("  Free ranges: {}", stats.reservation.free_range_count);
    println!("\nSharing cache:");
    println!("  Cached pages: {}", stats.sharing_cache.cached_pages);
    println!("  Cached bytes: {} B", stats.sharing_cache.cached_bytes);
    println!("  Reused:       {}", stats.sharing_cache.pages_reused);
    println!("  Carved:       {}", stats.sharing_cache.pages_carved);

    Ok(())
}

fn exercise<C: HeapConfig>(heap_config: C, args: &HeapStatsArgs) -> anyhow::Result<()> {
    let name = heap_config.name();
    let heap = SegregatedHeap::new(heap_config, args.object_size);

    let mut addresses = Vec::with_capacity(args.objects);
    for _ in 0..args.objects {
        let result = heap.allocate();
        if !result.did_succeed {
            anyhow::bail!("{} ran out of memory after {} objects", name, addresses.len());
        }
        addresses.push(result.begin);
    }
    let pages = heap.page_count();

    for address in addresses {
        heap.deallocate(address);
    }

    println!(
        "  {:<28} pages {:>5}  live after free {}",
        name,
        pages,
        heap.live_objects()
    );
    Ok(())
}
