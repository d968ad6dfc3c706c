//! Validated resource names.
//!
//! A `ResourceName` is the only way a name reaches a path or a command. It can
//! only be built through [`ResourceName::parse`], which enforces the allow-list
//! `[A-Za-z0-9_-]{1,128}` and rejects any `..` substring.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ResourceError;

pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let reject = |reason: &str| ResourceError::InvalidName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(reject("empty"));
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(reject("longer than 128 characters"));
        }
        // Unreachable with the charset below, kept as its own check.
        if raw.contains("..") {
            return Err(reject("contains '..'"));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(reject(&format!("character {:?} is not allowed", bad)));
        }

        Ok(Self(raw.to_string()))
    }

    /// Name leased by a delegated phase: `arc-<phase>-<run suffix>`.
    pub fn for_phase(phase: &str, run_id: &str) -> Result<Self, ResourceError> {
        let suffix = run_id.strip_prefix("arc-").unwrap_or(run_id);
        Self::parse(&format!("arc-{}-{}", phase, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.0.starts_with(p.as_str()))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ResourceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ResourceName::parse(&raw).map_err(serde::de::Error::custom)
    }
}
