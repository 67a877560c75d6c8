use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use libfsio::{Deadline, Entity, Error, FilesystemMutex, FsMutexConfig, PathDiscovery};
use tracing_subscriber::EnvFilter;

/// Exit status when the entity set could not be acquired in time.
const EXIT_TIMED_OUT: i32 = 2;

#[derive(Parser)]
#[command(name = "fslock")]
#[command(about = "Lock entities across processes through a shared lock file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Acquire a set of entities, hold them, then release them")]
    Lock(LockArgs),
    #[command(about = "List usable temporary directories and what backs them")]
    Discover(DiscoverArgs),
}

#[derive(Args)]
struct LockArgs {
    /// Directory holding the shared lock file
    #[arg(long)]
    dir: PathBuf,
    /// NAME locks exclusively, NAME:shared locks shared
    #[arg(long = "entity", value_name = "NAME[:shared]", required = true)]
    entities: Vec<String>,
    /// Give up after this long; waits forever when absent
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// How long to hold the entities once acquired
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,
    /// JSON file with the mutex configuration
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct DiscoverArgs {
    /// Directories to try before any other
    #[arg(long = "override", value_name = "DIR")]
    overrides: Vec<PathBuf>,
    /// Directories to try after the system ones
    #[arg(long = "fallback", value_name = "DIR")]
    fallbacks: Vec<PathBuf>,
    #[arg(long)]
    json: bool,
}

fn parse_entity(spec: &str) -> anyhow::Result<Entity> {
    let (name, exclusive) = match spec.rsplit_once(':') {
        Some((name, "shared")) => (name, false),
        Some((name, "exclusive")) => (name, true),
        _ => (spec, true),
    };
    if name.is_empty() {
        return Err(anyhow!("empty entity name in {spec:?}"));
    }
    Ok(Entity::from_name(name, exclusive))
}

fn unix_nanos() -> anyhow::Result<u128> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos())
}

fn lock(args: LockArgs) -> anyhow::Result<i32> {
    let config = match &args.config {
        Some(path) => FsMutexConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FsMutexConfig::default(),
    };
    let entities = args
        .entities
        .iter()
        .map(|s| parse_entity(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mutex = FilesystemMutex::with_config(&args.dir, config)?;
    let deadline = args.timeout_ms.map(|ms| Deadline::after(Duration::from_millis(ms)));

    let mut guard = match mutex.lock(&entities, deadline) {
        Ok(guard) => guard,
        Err(Error::TimedOut) => {
            tracing::info!(dir = %args.dir.display(), "timed out waiting for entities");
            return Ok(EXIT_TIMED_OUT);
        }
        Err(e) => return Err(e).context("failed to lock entities"),
    };

    let mut out = std::io::stdout().lock();
    writeln!(out, "LOCKED {}", unix_nanos()?)?;
    out.flush()?;
    std::thread::sleep(Duration::from_millis(args.hold_ms));
    // stamped while still held
    let released = unix_nanos()?;
    guard.unlock().context("failed to unlock entities")?;
    writeln!(out, "RELEASED {released}")?;
    out.flush()?;
    Ok(0)
}

fn discover(args: DiscoverArgs) -> anyhow::Result<i32> {
    let discovery = PathDiscovery::new();
    discovery.all_temporary_directories(true, &args.fallbacks, &args.overrides);
    let verified = discovery.verified_temporary_directories();

    let mut out = std::io::stdout().lock();
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&verified)?)?;
        return Ok(0);
    }
    for d in &verified {
        let backing = if d.is_storage_backed() {
            "storage"
        } else if d.is_memory_backed() {
            "memory"
        } else {
            "unknown"
        };
        writeln!(
            out,
            "{}\t{}\t{}\t{}{}",
            d.path.display(),
            d.source,
            d.fs_type.as_deref().unwrap_or("-"),
            backing,
            if d.is_networked() { "\tnetworked" } else { "" }
        )?;
    }
    Ok(0)
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Lock(args) => lock(args)?,
        Commands::Discover(args) => discover(args)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
