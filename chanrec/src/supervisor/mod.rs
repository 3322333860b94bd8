//! Recording supervisor.
//!
//! Owns the channel → session map and drives each channel through
//! `Offline → Live → Finalizing → Offline`. Every mutation goes through
//! [`RecordingSupervisor::observe`] or [`RecordingSupervisor::remove`], which
//! serialize on one lock, so a session is created at most once per live period
//! and finalized exactly once.
//!
//! Teardown (chat cancel, capture stop, finalize) runs on its own task; the
//! channel stays `Finalizing` until it completes.

mod session;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::recorder::{CaptureStatus, ChatRecorder, Finalizer, StreamCapture};
use crate::{Error, Result};

pub use session::{FinalizeOutcome, RecordingSession, session_paths};

/// Externally visible state of a tracked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Offline,
    Live,
    Finalizing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Live => write!(f, "live"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// What an observation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A new session was created.
    Started,
    /// Teardown of the active session was scheduled.
    Stopping,
    /// Nothing to do.
    Unchanged,
    /// The observation was stale or arrived after shutdown.
    Ignored,
}

/// Result of [`RecordingSupervisor::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The channel had no session.
    Idle,
    /// A session was torn down before the channel was dropped.
    Finalized(FinalizeOutcome),
}

type OutcomeRx = watch::Receiver<Option<FinalizeOutcome>>;

enum Slot {
    Offline,
    Live(RecordingSession),
    Finalizing(OutcomeRx),
}

impl Slot {
    fn state(&self) -> ChannelState {
        match self {
            Self::Offline => ChannelState::Offline,
            Self::Live(_) => ChannelState::Live,
            Self::Finalizing(_) => ChannelState::Finalizing,
        }
    }

    fn outcome_rx(&self) -> Option<OutcomeRx> {
        match self {
            Self::Finalizing(rx) => Some(rx.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<String, Slot>,
    /// Removal epoch at which each channel was last removed.
    retired: HashMap<String, u64>,
    removal_epoch: u64,
    closed: bool,
}

impl State {
    /// Record that `channel` was removed, invalidating observations from
    /// listings taken before now.
    fn retire(&mut self, channel: &str) {
        self.removal_epoch += 1;
        self.retired.insert(channel.to_string(), self.removal_epoch);
    }

    /// Forget retirements no open listing can still observe.
    fn prune_retired(&mut self, listings: &BTreeMap<u64, usize>) {
        let floor = listings
            .keys()
            .next()
            .copied()
            .unwrap_or(self.removal_epoch);
        self.retired.retain(|_, removed_at| *removed_at > floor);
    }
}

/// A registry listing taken at a removal epoch.
///
/// Observations made through it are ignored for channels removed after it
/// was opened. Retirements are kept only while a listing that predates them
/// is open.
pub struct Listing {
    epoch: u64,
    inner: Arc<Inner>,
}

impl Drop for Listing {
    fn drop(&mut self) {
        let mut listings = self.inner.listings.lock();
        if let Some(open) = listings.get_mut(&self.epoch) {
            *open -= 1;
            if *open == 0 {
                listings.remove(&self.epoch);
            }
        }
    }
}

enum Action {
    None,
    Start,
    Teardown,
}

struct Inner {
    capture: Arc<dyn StreamCapture>,
    chat: ChatRecorder,
    finalizer: Arc<dyn Finalizer>,
    temp_dir: PathBuf,
    state: Mutex<State>,
    /// Open listings per epoch. Locked after `state`, never before.
    listings: parking_lot::Mutex<BTreeMap<u64, usize>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RecordingSupervisor {
    inner: Arc<Inner>,
}

impl RecordingSupervisor {
    pub fn new(
        capture: Arc<dyn StreamCapture>,
        chat: ChatRecorder,
        finalizer: Arc<dyn Finalizer>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capture,
                chat,
                finalizer,
                temp_dir: temp_dir.into(),
                state: Mutex::new(State::default()),
                listings: parking_lot::Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Apply one live/offline observation for `channel`.
    ///
    /// Repeated observations of the current state are no-ops. A capture that
    /// stopped on its own, or a chat log that stopped being written, counts
    /// as an offline transition.
    pub async fn observe(&self, channel: &str, live: bool) -> Result<Transition> {
        let mut state = self.inner.state.lock().await;
        self.apply(&mut state, channel, live).await
    }

    /// Open a listing. Take it before reading the registry.
    pub async fn begin_listing(&self) -> Listing {
        let mut state = self.inner.state.lock().await;
        let epoch = state.removal_epoch;
        let mut listings = self.inner.listings.lock();
        *listings.entry(epoch).or_default() += 1;
        state.prune_retired(&listings);
        Listing {
            epoch,
            inner: self.inner.clone(),
        }
    }

    /// Like [`observe`](Self::observe), for a channel found through `listing`.
    ///
    /// Channels removed after the listing was opened are ignored.
    pub async fn observe_listed(
        &self,
        channel: &str,
        live: bool,
        listing: &Listing,
    ) -> Result<Transition> {
        let mut state = self.inner.state.lock().await;
        if let Some(&removed_at) = state.retired.get(channel) {
            if removed_at > listing.epoch {
                debug!(channel = %channel, "Ignoring observation for removed channel");
                return Ok(Transition::Ignored);
            }
            state.retired.remove(channel);
        }
        self.apply(&mut state, channel, live).await
    }

    async fn apply(&self, state: &mut State, channel: &str, live: bool) -> Result<Transition> {
        if state.closed {
            return Ok(Transition::Ignored);
        }

        let action = match state.channels.get(channel) {
            None | Some(Slot::Offline) if live => Action::Start,
            None | Some(Slot::Offline) | Some(Slot::Finalizing(_)) => Action::None,
            Some(Slot::Live(session)) => match session.capture_status() {
                CaptureStatus::Running if !session.chat_active() => {
                    warn!(channel = %channel, "Chat log stopped, finalizing session");
                    Action::Teardown
                }
                CaptureStatus::Running if live => Action::None,
                CaptureStatus::Running => {
                    info!(channel = %channel, "Channel went offline");
                    Action::Teardown
                }
                CaptureStatus::Crashed => {
                    let err = Error::ProcessCrash {
                        channel: channel.to_string(),
                        reason: "capture exited with failure".to_string(),
                    };
                    warn!(channel = %channel, error = %err, "Finalizing partial capture");
                    Action::Teardown
                }
                CaptureStatus::Exited => {
                    info!(channel = %channel, "Capture ended on its own");
                    Action::Teardown
                }
            },
        };

        match action {
            Action::None => {
                state
                    .channels
                    .entry(channel.to_string())
                    .or_insert(Slot::Offline);
                Ok(Transition::Unchanged)
            }
            Action::Start => self.start_session(state, channel).await,
            Action::Teardown => {
                self.begin_teardown(state, channel)?;
                Ok(Transition::Stopping)
            }
        }
    }

    async fn start_session(&self, state: &mut State, channel: &str) -> Result<Transition> {
        // Tracked as offline until both handles exist.
        state
            .channels
            .insert(channel.to_string(), Slot::Offline);

        let started_at = Utc::now();
        let (raw_path, chat_path) = session_paths(&self.inner.temp_dir, channel, started_at);

        let mut capture = self.inner.capture.start(channel, &raw_path).await?;
        let chat = match self.inner.chat.start(channel, &chat_path).await {
            Ok(chat) => chat,
            Err(e) => {
                capture.stop().await;
                return Err(e);
            }
        };

        let session =
            RecordingSession::new(channel, started_at, raw_path, chat_path, capture, chat);
        info!(channel = %channel, session_id = %session.id(), "Recording started");
        state
            .channels
            .insert(channel.to_string(), Slot::Live(session));
        Ok(Transition::Started)
    }

    /// Move a live channel to `Finalizing` and spawn its teardown.
    fn begin_teardown(&self, state: &mut State, channel: &str) -> Result<OutcomeRx> {
        let session = match state.channels.remove(channel) {
            Some(Slot::Live(session)) => session,
            Some(other) => {
                let current = other.state();
                state.channels.insert(channel.to_string(), other);
                return Err(Error::ConcurrentTransition {
                    channel: channel.to_string(),
                    state: current.to_string(),
                });
            }
            None => return Err(Error::unknown_channel(channel)),
        };

        let (tx, rx) = watch::channel(None);
        state
            .channels
            .insert(channel.to_string(), Slot::Finalizing(rx.clone()));

        let inner = self.inner.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let outcome = session.teardown(inner.finalizer.as_ref()).await;

            let mut state = inner.state.lock().await;
            if let Some(slot) = state.channels.get_mut(&channel)
                && matches!(slot, Slot::Finalizing(_))
            {
                *slot = Slot::Offline;
            }
            let _ = tx.send(Some(outcome));
        });

        Ok(rx)
    }

    /// Tear down `channel`'s session, if any, and stop tracking it.
    ///
    /// Returns only after finalize has run. Fails with
    /// [`Error::UnknownChannel`] when the channel is not tracked.
    pub async fn remove(&self, channel: &str) -> Result<RemovalOutcome> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            let current = state
                .channels
                .get(channel)
                .map(|slot| (slot.state(), slot.outcome_rx()));
            let rx = match current {
                None => return Err(Error::unknown_channel(channel)),
                Some((ChannelState::Live, _)) => Some(self.begin_teardown(&mut state, channel)?),
                Some((_, rx)) => rx,
            };

            state.retire(channel);

            match rx {
                Some(rx) => rx,
                None => {
                    state.channels.remove(channel);
                    info!(channel = %channel, "Channel removed");
                    return Ok(RemovalOutcome::Idle);
                }
            }
        };

        let outcome = wait_for_outcome(rx).await;

        let mut state = self.inner.state.lock().await;
        let drop_entry = match state.channels.get(channel) {
            Some(Slot::Offline) => true,
            // Teardown task died without reporting.
            Some(Slot::Finalizing(rx)) => rx.has_changed().is_err(),
            _ => false,
        };
        if drop_entry {
            state.channels.remove(channel);
        }
        info!(channel = %channel, "Channel removed after finalize");
        Ok(RemovalOutcome::Finalized(outcome))
    }

    /// Mark `channel` as removed without touching its tracked state.
    ///
    /// Call before [`remove`](Self::remove) when the channel has just left the
    /// registry, so a listing already in flight cannot start a session for it
    /// even if it was never observed.
    pub async fn retire(&self, channel: &str) {
        let mut state = self.inner.state.lock().await;
        state.retire(channel);
        let listings = self.inner.listings.lock();
        state.prune_retired(&listings);
    }

    /// Allow observations for a previously removed channel again.
    pub async fn readmit(&self, channel: &str) {
        self.inner.state.lock().await.retired.remove(channel);
    }

    pub async fn removal_epoch(&self) -> u64 {
        self.inner.state.lock().await.removal_epoch
    }

    /// Channels whose late observations are currently being ignored, sorted.
    pub async fn retired_channels(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut retired: Vec<String> = state.retired.keys().cloned().collect();
        retired.sort();
        retired
    }

    /// Channels with a non-disposed session (`Live` or `Finalizing`), sorted.
    pub async fn live_channels(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut live: Vec<String> = state
            .channels
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Offline))
            .map(|(name, _)| name.clone())
            .collect();
        live.sort();
        live
    }

    /// Every channel with tracked state, sorted.
    pub async fn tracked_channels(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut tracked: Vec<String> = state.channels.keys().cloned().collect();
        tracked.sort();
        tracked
    }

    pub async fn state_of(&self, channel: &str) -> Option<ChannelState> {
        self.inner
            .state
            .lock()
            .await
            .channels
            .get(channel)
            .map(Slot::state)
    }

    /// Stop accepting observations and tear down every session.
    ///
    /// Returns once every teardown, including ones already in flight, has
    /// finished.
    pub async fn shutdown(&self) -> Vec<(String, FinalizeOutcome)> {
        let pending = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;

            let live: Vec<String> = state
                .channels
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(name, _)| name.clone())
                .collect();
            for channel in &live {
                if let Err(e) = self.begin_teardown(&mut state, channel) {
                    error!(channel = %channel, error = %e, "Failed to start teardown");
                }
            }

            state
                .channels
                .iter()
                .filter_map(|(name, slot)| match slot {
                    Slot::Finalizing(rx) => Some((name.clone(), rx.clone())),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        if !pending.is_empty() {
            info!(sessions = pending.len(), "Waiting for sessions to finalize");
        }

        join_all(
            pending
                .into_iter()
                .map(|(name, rx)| async move { (name, wait_for_outcome(rx).await) }),
        )
        .await
    }
}

async fn wait_for_outcome(mut rx: OutcomeRx) -> FinalizeOutcome {
    let result = rx
        .wait_for(Option::is_some)
        .await
        .map(|outcome| (*outcome).clone());
    match result {
        Ok(Some(outcome)) => outcome,
        _ => FinalizeOutcome::Failed("teardown task ended without reporting".to_string()),
    }
}
