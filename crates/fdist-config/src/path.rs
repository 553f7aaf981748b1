//! Path helpers shared by the registry, server and CLI.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Canonical form of `path`, or `path` itself when it cannot be resolved.
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Check that a logical path stays inside the directory it is resolved
/// against: relative, and without `..` or root components.
pub fn is_contained_relative(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Resolve `relative` under `base`, rejecting paths that would escape it.
pub fn resolve_within(base: impl AsRef<Path>, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let relative = relative.as_ref();
    if !is_contained_relative(relative) {
        anyhow::bail!(
            "Path '{}' must be relative and stay inside '{}'",
            relative.display(),
            base.as_ref().display()
        );
    }
    Ok(base.as_ref().join(relative))
}

/// This host's name, as recorded in registry snapshots.
pub fn local_hostname() -> Result<String> {
    if let Ok(name) = std::env::var("FDIST_HOSTNAME") {
        return Ok(name);
    }
    let name = nix::unistd::gethostname().context("Cannot determine local hostname")?;
    Ok(name.to_string_lossy().into_owned())
}
