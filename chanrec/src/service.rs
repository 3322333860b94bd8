//! Channel management boundary.
//!
//! The entry point any request layer (the CLI here) uses to add, list and
//! delete channels. Deletion tears down an active recording before it reports
//! success.

use std::sync::Arc;

use tracing::info;

use crate::registry::{ChannelRegistry, normalize_channel_name};
use crate::supervisor::{RecordingSupervisor, RemovalOutcome};
use crate::{Error, Result};

pub struct ChannelService {
    registry: Arc<dyn ChannelRegistry>,
    supervisor: Option<RecordingSupervisor>,
}

impl ChannelService {
    /// A service that also drives a running supervisor.
    pub fn new(registry: Arc<dyn ChannelRegistry>, supervisor: RecordingSupervisor) -> Self {
        Self {
            registry,
            supervisor: Some(supervisor),
        }
    }

    /// A service that only edits the registry, for use while no monitor runs
    /// in this process.
    pub fn registry_only(registry: Arc<dyn ChannelRegistry>) -> Self {
        Self {
            registry,
            supervisor: None,
        }
    }

    /// Register a channel. Returns its canonical name.
    pub async fn add(&self, name: &str) -> Result<String> {
        let name = normalize_channel_name(name)?;
        if !self.registry.add(&name).await? {
            return Err(Error::DuplicateChannel(name));
        }
        if let Some(supervisor) = &self.supervisor {
            supervisor.readmit(&name).await;
        }
        info!(channel = %name, "Channel added");
        Ok(name)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.registry.list().await
    }

    /// Unregister a channel, finalizing its recording if one is active.
    ///
    /// Fails with [`Error::Validation`] for a malformed name and
    /// [`Error::UnknownChannel`] when the channel is not registered.
    pub async fn delete(&self, name: &str) -> Result<Option<RemovalOutcome>> {
        let name = normalize_channel_name(name)?;
        if !self.registry.remove(&name).await? {
            return Err(Error::unknown_channel(name));
        }
        info!(channel = %name, "Channel deleted from registry");

        let Some(supervisor) = &self.supervisor else {
            return Ok(None);
        };
        // A poll that listed the channel before now must not start a session.
        supervisor.retire(&name).await;
        match supervisor.remove(&name).await {
            Ok(outcome) => Ok(Some(outcome)),
            // Registered but never observed.
            Err(Error::UnknownChannel(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
