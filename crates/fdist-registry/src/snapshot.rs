use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use fdist_cas::FileReference;

use crate::{RegistryError, Result};

/// Persisted registry state of one application package.
///
/// ```text
/// cfg1.example.com
/// models/m.bin<TAB>3f1c9a27b0e4d6c2
/// https://repo.example.com/lib.jar<TAB>a9e0f4417d3b20c5
/// ```
///
/// The first line names the host that wrote the snapshot; every following
/// line is one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub hostname: String,
    pub entries: Vec<(String, FileReference)>,
}

impl RegistrySnapshot {
    pub fn new(hostname: impl Into<String>, entries: Vec<(String, FileReference)>) -> Self {
        Self {
            hostname: hostname.into(),
            entries,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let hostname = match lines.next() {
            Some(h) if !h.trim().is_empty() && !h.contains('\t') => h.trim().to_string(),
            _ => {
                return Err(RegistryError::InvalidSnapshot {
                    line: 1,
                    reason: "missing hostname".to_string(),
                })
            }
        };

        let mut entries = Vec::new();
        for (idx, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let line_no = idx + 2;
            let (name, value) = line.rsplit_once('\t').ok_or_else(|| RegistryError::InvalidSnapshot {
                line: line_no,
                reason: "expected name<TAB>reference".to_string(),
            })?;
            let reference =
                FileReference::parse(value).ok_or_else(|| RegistryError::InvalidSnapshot {
                    line: line_no,
                    reason: format!("invalid file reference {:?}", value),
                })?;
            entries.push((name.to_string(), reference));
        }

        Ok(Self { hostname, entries })
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64 + self.entries.len() * 48);
        out.push_str(&self.hostname);
        out.push('\n');
        for (name, reference) in &self.entries {
            out.push_str(name);
            out.push('\t');
            out.push_str(reference.as_str());
            out.push('\n');
        }
        out
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Write atomically: a reader sees either the old snapshot or the new one.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(self.render().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn references(&self) -> impl Iterator<Item = &FileReference> {
        self.entries.iter().map(|(_, reference)| reference)
    }
}
