use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::{RegistryError, Result};

/// Downloads the content behind a URI into a local file.
pub trait UriFetcher: Send + Sync + fmt::Debug {
    fn fetch(&self, uri: &str, target: &Path) -> Result<()>;
}

/// Plain HTTP(S) GET with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl UriFetcher for HttpFetcher {
    fn fetch(&self, uri: &str, target: &Path) -> Result<()> {
        let failed = |e: reqwest::Error| RegistryError::Download {
            uri: uri.to_string(),
            reason: e.to_string(),
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(failed)?;
        let mut response = client
            .get(uri)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(failed)?;

        let mut file = File::create(target)?;
        response.copy_to(&mut file).map_err(failed)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// Lowercased scheme of `uri`, if it has one.
pub(crate) fn scheme(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// File name to store a download under: the last path segment of the URI,
/// without query or fragment.
pub(crate) fn download_name(uri: &str) -> String {
    let without_suffix = uri.split(['?', '#']).next().unwrap_or(uri);
    let path = without_suffix
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_suffix);
    match path.split_once('/') {
        Some((_, path)) => path
            .rsplit('/')
            .find(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
            .unwrap_or("download")
            .to_string(),
        None => "download".to_string(),
    }
}
