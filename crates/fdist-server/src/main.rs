use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fdist_cas::ContentStore;
use fdist_config::logging::{init_logging, LogLevel};
use fdist_config::Config;
use fdist_lock::{DistributedLock, FileCoordinator};
use fdist_registry::ActiveApplications;
use fdist_server::maintenance::{PackageRedownloader, PeriodicJob, RetentionMaintainer, RetentionPolicy};
use fdist_server::FileServer;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Parser)]
#[command(name = "fdistd")]
#[command(version, about = "fdist file distribution daemon", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    match cli.command.unwrap_or(Commands::Start { port: None }) {
        Commands::Start { port } => {
            let mut config = fdist_config::config();
            if let Some(port) = port {
                config.server.port = port;
            }
            start_daemon(config).await?
        }
        Commands::DefaultConfig => print!("{}", Config::default_toml()?),
    }

    Ok(())
}

async fn start_daemon(config: Config) -> Result<()> {
    tracing::info!("fdistd: Starting daemon...");

    let lock_dir = config.lock_dir();
    let coordinator = FileCoordinator::new(&lock_dir)
        .with_context(|| format!("Failed to open lock directory {}", lock_dir.display()))?;
    let lock = DistributedLock::new(config.lock.scope.clone(), Arc::new(coordinator))
        .with_default_timeout(config.lock.timeout());

    let store_root = config.store_root();
    let store = ContentStore::new(&store_root)
        .with_context(|| format!("Failed to open store at {}", store_root.display()))?
        .with_lock(Arc::new(lock));
    tracing::info!("fdistd: Store at {}", store_root.display());

    let applications = ActiveApplications::new(config.state_dir(), config.lock.timeout());

    let retention = RetentionMaintainer::new(
        store.clone(),
        Arc::new(applications.clone()),
        RetentionPolicy::from_config(&config.retention),
    );
    let mut jobs = vec![PeriodicJob::spawn(
        retention,
        config.retention.interval(),
        config.retention.interval(),
    )?];

    let peers = config.redownload.peer_addrs()?;
    if peers.is_empty() {
        tracing::info!("fdistd: No peers configured, package re-download disabled");
    } else {
        let redownloader = PackageRedownloader::new(
            store.clone(),
            applications,
            peers,
            config.notify.timeout(),
            tokio::runtime::Handle::current(),
        );
        jobs.push(PeriodicJob::spawn(
            redownloader,
            config.redownload.interval(),
            config.redownload.interval(),
        )?);
    }

    let listen_addr = config.server.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let server = Arc::new(
        FileServer::new(store, config.server.worker_count())
            .with_max_frame_bytes(config.server.max_frame_bytes),
    );
    server
        .serve(listener, async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("fdistd: Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("fdistd: Shutdown signal received");
        })
        .await?;

    // Jobs block on a running pass; join them off the runtime threads
    tokio::task::spawn_blocking(move || {
        for job in jobs {
            job.stop();
        }
    })
    .await?;

    tracing::info!("fdistd: Shutting down");
    Ok(())
}
