use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CasError;

/// Content-derived identifier of a stored blob.
///
/// The value is the lowercase hex form of an unsigned 64-bit hash, without
/// leading zeros. One sentinel value exists, [`FileReference::non_existing`],
/// handed out by lenient registries for files that could not be found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileReference(String);

impl FileReference {
    pub const NON_EXISTING: &'static str = "non-existing-file";

    pub fn from_hash(hash: u64) -> Self {
        Self(format!("{:x}", hash))
    }

    /// Parse a reference value, accepting only well-formed hashes and the sentinel.
    pub fn parse(value: &str) -> Option<Self> {
        if value == Self::NON_EXISTING || is_hash_value(value) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    pub fn non_existing() -> Self {
        Self(Self::NON_EXISTING.to_string())
    }

    pub fn is_non_existing(&self) -> bool {
        self.0 == Self::NON_EXISTING
    }

    /// The hash this reference names; `None` for the sentinel.
    pub fn hash_value(&self) -> Option<u64> {
        u64::from_str_radix(&self.0, 16).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_hash_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 16
        && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && (value == "0" || !value.starts_with('0'))
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileReference {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CasError::InvalidReference(s.to_string()))
    }
}

impl TryFrom<String> for FileReference {
    type Error = CasError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileReference> for String {
    fn from(reference: FileReference) -> Self {
        reference.0
    }
}

impl AsRef<str> for FileReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
