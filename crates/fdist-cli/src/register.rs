//! Registration commands operating on an application's registry snapshot.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use fdist_config::path::local_hostname;
use fdist_config::Config;
use fdist_registry::{FileRegistry, HttpFetcher, RegistrySnapshot};

use crate::{open_store, validate_app_id};

/// Which application's registry a command works on.
#[derive(Args, Debug)]
pub struct Target {
    /// Application id
    #[arg(long)]
    pub app: String,

    /// Directory registered paths are relative to
    #[arg(long, default_value = ".")]
    pub app_dir: PathBuf,

    /// Ignore the existing snapshot and re-hash everything
    #[arg(long)]
    pub fresh: bool,
}

struct Session {
    registry: FileRegistry,
    snapshot_path: PathBuf,
}

impl Session {
    fn open(config: &Config, target: &Target) -> Result<Self> {
        validate_app_id(&target.app)?;
        let store = open_store(config)?;
        let snapshot_path = config.snapshot_path(&target.app);

        let registry = if !target.fresh && snapshot_path.exists() {
            // Errors must surface here; leniency is for restoring a deployment
            FileRegistry::load(store, &target.app_dir, &snapshot_path)
                .with_context(|| format!("Cannot restore snapshot {}", snapshot_path.display()))?
                .lenient(false)
        } else {
            FileRegistry::new(store, &target.app_dir)
        };
        let registry = registry
            .hosted(config.registry.hosted)
            .with_fetcher(Arc::new(HttpFetcher::new(config.registry.download_timeout())));

        Ok(Self {
            registry,
            snapshot_path,
        })
    }

    fn save(self) -> Result<()> {
        let hostname = local_hostname()?;
        self.registry
            .snapshot(hostname)
            .write(&self.snapshot_path)
            .with_context(|| format!("Cannot write snapshot {}", self.snapshot_path.display()))?;
        Ok(())
    }
}

pub fn add_files(config: &Config, target: &Target, paths: &[String]) -> Result<()> {
    let session = Session::open(config, target)?;
    for path in paths {
        let reference = session
            .registry
            .add_file(path)
            .with_context(|| format!("Cannot register {}", path))?;
        println!("{}\t{}", path, reference);
    }
    session.save()
}

pub fn add_blob(config: &Config, target: &Target, name: &str, source: &Path) -> Result<()> {
    let bytes = if source == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(source).with_context(|| format!("Cannot read {}", source.display()))?
    };

    let session = Session::open(config, target)?;
    let reference = session.registry.add_blob(name, &bytes)?;
    println!("{}\t{}", name, reference);
    session.save()
}

pub fn add_uris(config: &Config, target: &Target, uris: &[String]) -> Result<()> {
    let session = Session::open(config, target)?;
    for uri in uris {
        let reference = session
            .registry
            .add_uri(uri)
            .with_context(|| format!("Cannot register {}", uri))?;
        println!("{}\t{}", uri, reference);
    }
    session.save()
}

/// Print the snapshot of `app` as `name<TAB>reference` lines.
pub fn export(config: &Config, app: &str) -> Result<()> {
    validate_app_id(app)?;
    let path = config.snapshot_path(app);
    let snapshot =
        RegistrySnapshot::read(&path).with_context(|| format!("Cannot read {}", path.display()))?;

    let mut entries = snapshot.entries;
    entries.sort();
    for (name, reference) in entries {
        println!("{}\t{}", name, reference);
    }
    Ok(())
}
