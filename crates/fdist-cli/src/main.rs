//! # fdist CLI
//!
//! Register application files, manage the application index, trigger
//! downloads on other hosts and collect unused files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fdist_cas::{ContentStore, FileReference};
use fdist_config::logging::{init_logging, LogLevel};
use fdist_config::Config;
use fdist_ipc::client::FileClient;
use fdist_lock::{DistributedLock, FileCoordinator};
use fdist_registry::{ApplicationIndex, RegistrySnapshot};
use fdist_server::DistributionNotifier;

pub mod gc;
mod register;

/// fdist - content-addressed file distribution
#[derive(Parser)]
#[command(name = "fdist")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Blob store root (overrides config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// State directory holding snapshots and the application index
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register files or directories of an application
    AddFile {
        #[command(flatten)]
        target: register::Target,

        /// Paths relative to the application directory
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Register literal bytes under a name
    AddBlob {
        #[command(flatten)]
        target: register::Target,

        /// Logical file name (a ".gz" suffix stores the bytes compressed)
        #[arg(long)]
        name: String,

        /// File to read the bytes from ("-" for stdin)
        source: PathBuf,
    },

    /// Download and register remote files
    AddUri {
        #[command(flatten)]
        target: register::Target,

        #[arg(required = true)]
        uris: Vec<String>,
    },

    /// Print the registered name -> reference map of an application
    Export {
        /// Application id
        #[arg(long)]
        app: String,
    },

    /// Mark an application active so retention keeps its files
    RegisterApp {
        /// Application id
        app: String,

        /// Reference of the application package
        #[arg(long)]
        package: Option<String>,
    },

    /// Mark an application removed
    RemoveApp {
        /// Application id
        app: String,

        /// Also drop removed entries from the index
        #[arg(long)]
        prune: bool,
    },

    /// Delete files no active application uses (dry run by default)
    Gc(gc::GcArgs),

    /// Ask another host to start downloading references
    Notify {
        /// Host to notify
        host: String,

        /// File server port on that host
        #[arg(long, default_value_t = fdist_ipc::DEFAULT_PORT)]
        port: u16,

        /// Notify every reference of this application
        #[arg(long)]
        app: Option<String>,

        /// References to notify
        references: Vec<String>,
    },

    /// Fetch references from a file server into the local store
    Fetch {
        /// Host serving the files
        host: String,

        #[arg(long, default_value_t = fdist_ipc::DEFAULT_PORT)]
        port: u16,

        #[arg(required = true)]
        references: Vec<String>,
    },

    /// Show store and application statistics
    Status,

    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Quiet by default; command output goes to stdout
    let level = match cli.verbose {
        0 => LogLevel::Warn,
        v => LogLevel::from_verbosity(v),
    };
    init_logging(level);

    let mut config = fdist_config::config();
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    if let Some(state_dir) = cli.state_dir {
        config.storage.state_dir = state_dir;
    }

    match cli.command {
        Commands::AddFile { target, paths } => register::add_files(&config, &target, &paths),
        Commands::AddBlob {
            target,
            name,
            source,
        } => register::add_blob(&config, &target, &name, &source),
        Commands::AddUri { target, uris } => register::add_uris(&config, &target, &uris),
        Commands::Export { app } => register::export(&config, &app),
        Commands::RegisterApp { app, package } => cmd_register_app(&config, &app, package.as_deref()),
        Commands::RemoveApp { app, prune } => cmd_remove_app(&config, &app, prune),
        Commands::Gc(args) => gc::run(&config, args),
        Commands::Notify {
            host,
            port,
            app,
            references,
        } => cmd_notify(&config, &host, port, app.as_deref(), &references),
        Commands::Fetch {
            host,
            port,
            references,
        } => cmd_fetch(&config, &host, port, &references),
        Commands::Status => cmd_status(&config),
        Commands::DefaultConfig => {
            print!("{}", Config::default_toml()?);
            Ok(())
        }
    }
}

/// Open the configured store guarded by the cross-process store lock.
pub(crate) fn open_store(config: &Config) -> Result<ContentStore> {
    let lock_dir = config.lock_dir();
    let coordinator = FileCoordinator::new(&lock_dir)
        .with_context(|| format!("Failed to open lock directory {}", lock_dir.display()))?;
    let lock = DistributedLock::new(config.lock.scope.clone(), Arc::new(coordinator))
        .with_default_timeout(config.lock.timeout());

    let root = config.store_root();
    tracing::debug!("fdist: Using store {}", root.display());
    let store = ContentStore::new(&root)
        .with_context(|| format!("Failed to open store at {}", root.display()))?
        .with_lock(Arc::new(lock));
    Ok(store)
}

/// Application ids name snapshot files, so they must be plain file names.
pub(crate) fn validate_app_id(app: &str) -> Result<()> {
    if app.is_empty() || app == "." || app == ".." || app.contains(['/', '\\']) {
        bail!("Invalid application id {:?}", app);
    }
    Ok(())
}

fn parse_reference(value: &str) -> Result<FileReference> {
    FileReference::parse(value).with_context(|| format!("Invalid file reference {:?}", value))
}

fn cmd_register_app(config: &Config, app: &str, package: Option<&str>) -> Result<()> {
    validate_app_id(app)?;
    let package = package.map(parse_reference).transpose()?;
    let snapshot_path = config.snapshot_path(app);
    if !snapshot_path.exists() {
        bail!(
            "No snapshot for {} at {} (register files first)",
            app,
            snapshot_path.display()
        );
    }

    let state_dir = config.state_dir();
    let _lock = ApplicationIndex::acquire_lock(&state_dir, config.lock.timeout())
        .context("Failed to acquire application index lock")?;
    let mut index = ApplicationIndex::load_or_create(&state_dir)?;
    let is_new = index.register(app, &snapshot_path, package);
    index.save(&state_dir)?;

    if is_new {
        println!("Registered application {}", app);
    } else {
        println!("Refreshed application {}", app);
    }
    Ok(())
}

fn cmd_remove_app(config: &Config, app: &str, prune: bool) -> Result<()> {
    let state_dir = config.state_dir();
    let _lock = ApplicationIndex::acquire_lock(&state_dir, config.lock.timeout())
        .context("Failed to acquire application index lock")?;
    let mut index = ApplicationIndex::load_or_create(&state_dir)?;
    if !index.remove(app) {
        bail!("Unknown application {}", app);
    }
    let pruned = if prune { index.prune_removed() } else { 0 };
    index.save(&state_dir)?;

    println!("Removed application {}", app);
    if pruned > 0 {
        println!("Pruned {} removed entries", pruned);
    }
    Ok(())
}

fn cmd_notify(
    config: &Config,
    host: &str,
    port: u16,
    app: Option<&str>,
    references: &[String],
) -> Result<()> {
    let mut refs = references
        .iter()
        .map(|r| parse_reference(r))
        .collect::<Result<Vec<_>>>()?;
    if let Some(app) = app {
        validate_app_id(app)?;
        let snapshot = RegistrySnapshot::read(&config.snapshot_path(app))
            .with_context(|| format!("Cannot read snapshot of {}", app))?;
        refs.extend(snapshot.references().cloned());
    }
    refs.retain(|r| !r.is_non_existing());
    refs.sort();
    refs.dedup();
    if refs.is_empty() {
        bail!("Nothing to notify");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let notifier = DistributionNotifier::new(config.notify.timeout(), runtime.handle().clone());
    let count = refs.len();
    runtime
        .block_on(notifier.notify(host, port, refs))
        .with_context(|| format!("Failed to notify {}:{}", host, port))?;
    println!("Asked {}:{} to download {} files", host, port, count);
    Ok(())
}

fn cmd_fetch(config: &Config, host: &str, port: u16, references: &[String]) -> Result<()> {
    let refs = references
        .iter()
        .map(|r| parse_reference(r))
        .collect::<Result<Vec<_>>>()?;
    let store = open_store(config)?;
    let timeout = config.notify.timeout().max(Duration::from_secs(1));

    let runtime = tokio::runtime::Runtime::new()?;
    let fetched = runtime.block_on(async {
        let mut client = FileClient::connect(host, port, timeout).await?;
        let mut fetched = Vec::with_capacity(refs.len());
        for reference in &refs {
            fetched.push(client.receive_file(reference).await?);
        }
        Ok::<_, fdist_ipc::IpcError>(fetched)
    })?;

    for data in fetched {
        let path = store.install(&data)?;
        println!("{}  {}", data.reference, path.display());
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let store = ContentStore::new(config.store_root())?;
    let stats = store.stats()?;
    let index = ApplicationIndex::load_or_create(&config.state_dir())?;
    let active = index.active_applications().len();

    println!();
    println!("  Store: {}", store.root().display());
    println!(
        "    Files:          {} ({})",
        gc::format_number(stats.blob_count),
        gc::format_bytes(stats.total_bytes)
    );
    println!("    Regular files:  {}", gc::format_number(stats.file_count));
    if stats.partial_writes > 0 {
        println!("    Partial writes: {}", stats.partial_writes);
    }
    println!();
    println!(
        "  Applications: {} active, {} removed",
        active,
        index.applications.len() - active
    );
    println!();
    Ok(())
}
