//! Operator tooling for a message store data directory: dump, restore,
//! checkpoint, reclaim and inspect.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::exit;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use mqstore::{MessageStore, StoreConfig};

/// Args for mqstore-admin
#[derive(Parser)]
#[clap(author, version, about)]
#[clap(propagate_version = true)]
struct AdminArgs {
    /// Store data directory
    #[clap(long, value_parser)]
    dir: PathBuf,
    /// JSON config file; its directory is overridden by --dir
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    /// Subcommand
    #[clap(subcommand)]
    command: Commands,
}

/// Enum type of subcommand for mqstore-admin
#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the store contents to a dump file
    Export {
        /// Output file
        file: PathBuf,
    },
    /// Replace the store contents with a dump file
    Import {
        /// Input file
        file: PathBuf,
    },
    /// Take an index snapshot
    Snapshot,
    /// Delete log segments with no live references
    Gc,
    /// Print queues, key watermarks, segments and ledger counters
    Stat,
}

fn main() {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    if let Err(e) = run(AdminArgs::parse()) {
        error!("{:#}", e);
        exit(1);
    }
}

fn run(args: AdminArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
            serde_json::from_reader(file).with_context(|| format!("parsing {:?}", path))?
        }
        None => StoreConfig::default(),
    };
    config.directory = args.dir;

    let store = MessageStore::start(config).context("starting the store")?;
    let outcome = dispatch(&store, args.command);
    store.stop().context("stopping the store")?;
    outcome
}

fn dispatch(store: &MessageStore, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Export { file } => {
            let mut out = BufWriter::new(
                File::create(&file).with_context(|| format!("creating {:?}", file))?,
            );
            let stats = store.export(&mut out)?;
            info!("exported {}", stats);
        }
        Commands::Import { file } => {
            let mut input = BufReader::new(
                File::open(&file).with_context(|| format!("opening {:?}", file))?,
            );
            let stats = store.import(&mut input)?;
            info!("imported {}", stats);
        }
        Commands::Snapshot => {
            let position = store.snapshot_index()?;
            info!("index snapshot covers position {:#018x}", position);
        }
        Commands::Gc => {
            let deleted = store.gc()?;
            info!("deleted {} log segment(s)", deleted);
        }
        Commands::Stat => {
            let queues = store.list_queues()?;
            info!("queues: {}", queues.len());
            for queue in &queues {
                info!("  queue {} ({} metadata bytes)", queue.queue_key, queue.metadata.len());
            }
            info!("last message key: {}", store.get_last_message_key()?);
            info!("last queue key: {}", store.get_last_queue_key()?);
            for segment in store.segments()? {
                info!(
                    "  segment {:016x}.log [{}, {})",
                    segment.position, segment.position, segment.limit
                );
            }
            for (position, count) in store.segment_refs()? {
                info!("  segment {:016x}.log holds {} live reference(s)", position, count);
            }
        }
    }
    Ok(())
}
