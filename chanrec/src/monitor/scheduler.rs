//! Periodic poll loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::poller::LiveStatusPoller;
use crate::registry::ChannelRegistry;
use crate::supervisor::{RecordingSupervisor, RemovalOutcome, Transition};
use crate::{Error, Result};

/// Counters for one poll iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Channels whose status was requested.
    pub checked: usize,
    /// Status checks that failed; those channels keep their state.
    pub failed: usize,
    pub started: usize,
    pub stopping: usize,
    /// Observations the supervisor could not apply.
    pub errors: usize,
    /// Tracked channels no longer in the registry, handed to `remove`.
    pub removed: usize,
}

pub struct MonitorScheduler {
    registry: Arc<dyn ChannelRegistry>,
    poller: Arc<dyn LiveStatusPoller>,
    supervisor: RecordingSupervisor,
    interval: Duration,
    max_concurrent_checks: usize,
}

impl MonitorScheduler {
    pub fn new(
        registry: Arc<dyn ChannelRegistry>,
        poller: Arc<dyn LiveStatusPoller>,
        supervisor: RecordingSupervisor,
        interval: Duration,
        max_concurrent_checks: usize,
    ) -> Self {
        Self {
            registry,
            poller,
            supervisor,
            interval,
            max_concurrent_checks: max_concurrent_checks.max(1),
        }
    }

    /// Run poll iterations until `cancel` fires.
    ///
    /// The first iteration starts immediately. An iteration that overruns the
    /// interval causes the missed ticks to be skipped, not queued.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(?report, "Poll iteration finished"),
                        Err(e) => warn!(error = %e, "Poll iteration failed"),
                    }
                }
            }
        }

        info!("Monitor stopped");
    }

    /// One poll iteration.
    ///
    /// Fails only when the registry cannot be listed. Per-channel failures are
    /// logged, counted and leave that channel's state untouched.
    pub async fn tick(&self) -> Result<TickReport> {
        // Opened before listing so removals racing this iteration win.
        let listing = self.supervisor.begin_listing().await;
        let channels = self.registry.list().await?;

        let mut report = TickReport {
            removed: self.reconcile(&channels).await,
            ..TickReport::default()
        };

        let poller = &self.poller;
        let mut checks = stream::iter(channels)
            .map(|channel| async move {
                let result = poller.is_live(&channel).await;
                (channel, result)
            })
            .buffer_unordered(self.max_concurrent_checks);

        while let Some((channel, result)) = checks.next().await {
            report.checked += 1;
            let live = match result {
                Ok(live) => live,
                Err(e) => {
                    report.failed += 1;
                    warn!(channel = %channel, error = %e, "Status check failed, retrying next tick");
                    continue;
                }
            };

            match self.supervisor.observe_listed(&channel, live, &listing).await {
                Ok(Transition::Started) => report.started += 1,
                Ok(Transition::Stopping) => report.stopping += 1,
                Ok(Transition::Unchanged | Transition::Ignored) => {}
                Err(e @ Error::ProcessSpawn { .. }) => {
                    report.errors += 1;
                    error!(channel = %channel, error = %e, "Could not start recording");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(channel = %channel, error = %e, "Failed to apply status");
                }
            }
        }

        Ok(report)
    }

    /// Hand tracked channels missing from `listed` to `remove` on their own
    /// tasks. Returns how many were handed off.
    async fn reconcile(&self, listed: &[String]) -> usize {
        let listed: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .supervisor
            .tracked_channels()
            .await
            .into_iter()
            .filter(|name| !listed.contains(name.as_str()))
            .collect();

        for channel in &stale {
            info!(channel = %channel, "Channel left the registry");
            let supervisor = self.supervisor.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                match supervisor.remove(&channel).await {
                    Ok(RemovalOutcome::Finalized(outcome)) => {
                        debug!(channel = %channel, ?outcome, "Unregistered channel finalized")
                    }
                    Ok(RemovalOutcome::Idle) => {}
                    // Already removed by someone else.
                    Err(Error::UnknownChannel(_)) => {}
                    Err(e) => warn!(channel = %channel, error = %e, "Failed to remove channel"),
                }
            });
        }

        stale.len()
    }
}
