//! Channel registry: the set of channels configured for monitoring.
//!
//! The supervisor never owns channel metadata; it only reads names from here
//! each tick and is told about removals.

mod json_file;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;

use crate::{Error, Result};

pub use json_file::{ChannelRecord, JsonFileRegistry};

static CHANNEL_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,25}$").expect("static regex"));

/// Validate a channel login and return its canonical (lowercase) form.
pub fn normalize_channel_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("channel name is required"));
    }
    if !CHANNEL_NAME_REGEX.is_match(trimmed) {
        return Err(Error::validation(format!(
            "invalid channel name {trimmed:?}: expected 1-25 letters, digits or underscores"
        )));
    }
    Ok(trimmed.to_lowercase())
}

/// Store of registered channel names.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    /// All registered channel names, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Register `name`. Returns `false` when it was already present.
    async fn add(&self, name: &str) -> Result<bool>;

    /// Unregister `name`. Returns `false` when it was not present.
    async fn remove(&self, name: &str) -> Result<bool>;

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|n| n == name))
    }
}

/// Registry kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    channels: RwLock<BTreeSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: RwLock::new(channels.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl ChannelRegistry for MemoryRegistry {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.channels.read().iter().cloned().collect())
    }

    async fn add(&self, name: &str) -> Result<bool> {
        Ok(self.channels.write().insert(name.to_string()))
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.channels.write().remove(name))
    }

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.channels.read().contains(name))
    }
}
