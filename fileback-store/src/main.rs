//! fileback - store, fetch, copy and delete files by content key.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fileback_common::{DerivationConfig, FileContext, FileOperation, StorageBackend};
use fileback_store::{backend, StoreConfig};

const DEFAULT_CONFIG_PATH: &str = "fileback.toml";

/// Store and fetch files under hash-sharded paths
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the store configuration
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Keys are hex encoded bytes instead of UTF-8 text
    #[arg(long, global = true)]
    hex: bool,

    /// Suffix appended to derived paths
    #[arg(long, global = true)]
    suffix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the path a key resolves to
    Path { key: String },
    /// Store a file (stdin by default) under a key
    Write {
        key: String,
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Fetch the file stored under a key (to stdout by default)
    Read {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Copy the file stored under one key to another
    Copy { source: String, target: String },
    /// Delete the file stored under a key
    Delete { key: String },
}

/// What the back-end reported through the context receivers.
#[derive(Debug, Default)]
struct Outcome {
    source_path: Option<String>,
    target_path: Option<String>,
    copied: Option<u64>,
    deleted: Option<bool>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let outcome = RefCell::new(Outcome::default());

    match &args.command {
        Command::Path { key } => {
            let derivation = derivation_config(&args.config)?;
            let key = decode_key(key, args.hex)?;
            let mut path = derivation.deriver()?.derive(&key)?;
            if let Some(suffix) = args.suffix.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                path = format!("{path}.{suffix}");
            }
            println!("{path}");
            return Ok(());
        }
        Command::Write { key, input } => {
            let store = open_store(&args.config)?;
            let key = decode_key(key, args.hex)?;
            let input = input.clone();
            let mut ctx = context(FileOperation::Write, &args, &outcome).with_target_key(key);
            ctx.set_source_stream(move || match input {
                Some(path) => Ok(Box::new(File::open(path)?) as Box<dyn Read>),
                None => Ok(Box::new(io::stdin().lock()) as Box<dyn Read>),
            });
            run(store.as_ref(), ctx)?;
        }
        Command::Read { key, output } => {
            let store = open_store(&args.config)?;
            let key = decode_key(key, args.hex)?;
            let output = output.clone();
            let mut ctx = context(FileOperation::Read, &args, &outcome).with_source_key(key);
            ctx.set_target_stream(move || match output {
                Some(path) => Ok(Box::new(File::create(path)?) as Box<dyn Write>),
                None => Ok(Box::new(io::stdout().lock()) as Box<dyn Write>),
            });
            run(store.as_ref(), ctx)?;
        }
        Command::Copy { source, target } => {
            let store = open_store(&args.config)?;
            let ctx = context(FileOperation::Copy, &args, &outcome)
                .with_source_key(decode_key(source, args.hex)?)
                .with_target_key(decode_key(target, args.hex)?);
            run(store.as_ref(), ctx)?;
        }
        Command::Delete { key } => {
            let store = open_store(&args.config)?;
            let ctx = context(FileOperation::Delete, &args, &outcome)
                .with_source_key(decode_key(key, args.hex)?);
            run(store.as_ref(), ctx)?;
        }
    }

    report(&outcome.into_inner());
    Ok(())
}

fn open_store(config: &Path) -> Result<Box<dyn StorageBackend>> {
    let config = StoreConfig::load(config)?;
    backend::from_config(&config)
}

/// The derivation settings of the config file, or the defaults when there
/// is no config file yet.
fn derivation_config(path: &Path) -> Result<DerivationConfig> {
    if !path.exists() {
        return Ok(DerivationConfig::default());
    }
    Ok(StoreConfig::load(path)?.derivation)
}

fn decode_key(key: &str, is_hex: bool) -> Result<Vec<u8>> {
    if is_hex {
        return hex::decode(key).with_context(|| format!("Key is not valid hex: {key}"));
    }
    Ok(key.as_bytes().to_vec())
}

fn context<'a>(
    operation: FileOperation,
    args: &Args,
    outcome: &'a RefCell<Outcome>,
) -> FileContext<'a> {
    let mut ctx = FileContext::new().with_operation(operation);
    if let Some(suffix) = &args.suffix {
        ctx = ctx.with_file_suffix(suffix.clone());
    }
    ctx.set_source_path_receiver(move |path| outcome.borrow_mut().source_path = Some(path));
    ctx.set_target_path_receiver(move |path| outcome.borrow_mut().target_path = Some(path));
    ctx.set_bytes_copied_receiver(move |copied| outcome.borrow_mut().copied = copied);
    ctx.set_file_deleted_receiver(move |deleted| outcome.borrow_mut().deleted = Some(deleted));
    ctx
}

fn run(store: &dyn StorageBackend, mut ctx: FileContext<'_>) -> Result<()> {
    let operation = ctx.operation();
    store
        .operate(&mut ctx)
        .with_context(|| format!("{} failed", operation.map(|o| o.to_string()).unwrap_or_default()))
}

fn report(outcome: &Outcome) {
    if let Some(path) = &outcome.source_path {
        info!(path = %path, "Source");
    }
    if let Some(path) = &outcome.target_path {
        info!(path = %path, "Target");
    }
    match (outcome.copied, outcome.deleted) {
        (_, Some(true)) => info!("Deleted"),
        (_, Some(false)) => warn!("Nothing to delete"),
        (Some(bytes), None) => info!(bytes, "Transferred"),
        (None, None) => warn!("Nothing transferred, no file stored under that key"),
    }
}
