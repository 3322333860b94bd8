//! Integration tests for the recording lifecycle.
//!
//! The supervisor, scheduler and channel service are driven end to end with
//! in-process capture, chat and status fakes. Finalization uses either a
//! counting stand-in or the real ffmpeg finalizer pointed at a shell script.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use chanrec::monitor::{LiveStatusPoller, MonitorScheduler};
use chanrec::recorder::{
    ArchivedPaths, CaptureHandle, CaptureStatus, ChatFeed, ChatMessage, ChatRecorder, Finalizer,
    StreamCapture,
};
use chanrec::registry::{ChannelRegistry, MemoryRegistry};
use chanrec::service::ChannelService;
use chanrec::supervisor::{
    ChannelState, FinalizeOutcome, RecordingSupervisor, RemovalOutcome, Transition,
};
use chanrec::{Error, Result};

/// Poll `check` until it holds, failing the test after a few seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .collect();
    files.sort();
    files
}

/// Capture that writes a placeholder raw file and runs until stopped or
/// told to crash.
#[derive(Default)]
struct FakeCapture {
    starts: AtomicUsize,
    running: Arc<AtomicUsize>,
    fail_spawn: AtomicBool,
    crash_triggers: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl FakeCapture {
    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn crash(&self, channel: &str) {
        let trigger = self.crash_triggers.lock().remove(channel).unwrap();
        trigger.send(()).unwrap();
    }
}

#[async_trait]
impl StreamCapture for FakeCapture {
    async fn start(&self, channel: &str, output_path: &Path) -> Result<CaptureHandle> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(Error::spawn(
                "streamlink",
                std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            ));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, b"raw stream").await?;

        let (status_tx, status_rx) = watch::channel(CaptureStatus::Running);
        let (crash_tx, crash_rx) = oneshot::channel::<()>();
        self.crash_triggers
            .lock()
            .insert(channel.to_string(), crash_tx);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let running = self.running.clone();
        running.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                _ = task_cancel.cancelled() => CaptureStatus::Exited,
                Ok(()) = crash_rx => CaptureStatus::Crashed,
            };
            let _ = status_tx.send(status);
            running.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(CaptureHandle::new(
            channel,
            output_path,
            cancel,
            status_rx,
            task,
        ))
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Chat feed that delivers a fixed script and then idles until cancelled.
#[derive(Default)]
struct FakeFeed {
    messages: Vec<ChatMessage>,
    /// Return after the script instead of idling.
    stop_early: bool,
    runs: AtomicUsize,
    active: Arc<AtomicUsize>,
}

impl FakeFeed {
    fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    fn stopping_early() -> Self {
        Self {
            stop_early: true,
            ..Self::default()
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatFeed for FakeFeed {
    async fn run(
        &self,
        _channel: &str,
        tx: mpsc::Sender<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());

        for message in &self.messages {
            if tx.send(message.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.stop_early {
            return Ok(());
        }
        cancel.cancelled().await;
        Ok(())
    }
}

/// Finalizer that does nothing but succeed.
struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn finalize(&self, _: &str, _: &Path, _: &Path) -> Result<ArchivedPaths> {
        Ok(ArchivedPaths::default())
    }
}

/// Finalizer whose conversion always fails.
struct FailingFinalizer;

#[async_trait]
impl Finalizer for FailingFinalizer {
    async fn finalize(&self, _: &str, raw_path: &Path, _: &Path) -> Result<ArchivedPaths> {
        Err(Error::conversion(raw_path, "ffmpeg failed with exit code 1"))
    }
}

/// Counts calls and optionally holds each call until a permit is released.
struct CountingFinalizer {
    inner: Arc<dyn Finalizer>,
    calls: AtomicUsize,
    gate: Arc<Semaphore>,
}

impl CountingFinalizer {
    fn new(inner: Arc<dyn Finalizer>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    fn gated(inner: Arc<dyn Finalizer>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            ..Self::new(inner)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl Finalizer for CountingFinalizer {
    async fn finalize(
        &self,
        channel: &str,
        raw_path: &Path,
        chat_path: &Path,
    ) -> Result<ArchivedPaths> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        self.inner.finalize(channel, raw_path, chat_path).await
    }
}

struct Harness {
    dir: TempDir,
    capture: Arc<FakeCapture>,
    feed: Arc<FakeFeed>,
    finalizer: Arc<CountingFinalizer>,
    supervisor: RecordingSupervisor,
}

impl Harness {
    fn new() -> Self {
        Self::build(
            tempfile::tempdir().unwrap(),
            FakeFeed::default(),
            CountingFinalizer::new(Arc::new(NoopFinalizer)),
        )
    }

    fn build(dir: TempDir, feed: FakeFeed, finalizer: CountingFinalizer) -> Self {
        let capture = Arc::new(FakeCapture::default());
        let feed = Arc::new(feed);
        let finalizer = Arc::new(finalizer);
        let supervisor = RecordingSupervisor::new(
            capture.clone(),
            ChatRecorder::new(feed.clone()),
            finalizer.clone(),
            dir.path().join("temp"),
        );
        Self {
            dir,
            capture,
            feed,
            finalizer,
            supervisor,
        }
    }

    fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("temp")
    }

    async fn wait_for_state(&self, channel: &str, expected: Option<ChannelState>) {
        let supervisor = self.supervisor.clone();
        eventually(&format!("{channel} to reach {expected:?}"), || {
            let supervisor = supervisor.clone();
            async move { supervisor.state_of(channel).await == expected }
        })
        .await;
    }
}

mod supervisor_tests {
    use super::*;

    #[tokio::test]
    async fn test_live_observation_starts_one_session() {
        let h = Harness::new();

        let transition = h.supervisor.observe("alice", true).await.unwrap();

        assert_eq!(transition, Transition::Started);
        assert_eq!(h.capture.starts(), 1);
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Live));
        assert_eq!(h.supervisor.live_channels().await, vec!["alice"]);
        let feed = h.feed.clone();
        eventually("chat subscription", || {
            let feed = feed.clone();
            async move { feed.runs() == 1 }
        })
        .await;
        assert_eq!(files_with_extension(&h.temp_dir(), "ts").len(), 1);
        assert_eq!(files_with_extension(&h.temp_dir(), "txt").len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_live_observations_are_idempotent() {
        let h = Harness::new();

        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Started
        );
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Unchanged
        );

        assert_eq!(h.capture.starts(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.feed.runs(), 1);
        assert_eq!(h.supervisor.live_channels().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_offline_observation_finalizes_once() {
        let h = Harness::new();
        h.supervisor.observe("alice", true).await.unwrap();

        assert_eq!(
            h.supervisor.observe("alice", false).await.unwrap(),
            Transition::Stopping
        );
        h.wait_for_state("alice", Some(ChannelState::Offline)).await;

        assert_eq!(h.finalizer.calls(), 1);
        assert!(h.supervisor.live_channels().await.is_empty());
        assert_eq!(h.capture.running(), 0);
        assert_eq!(h.feed.active(), 0);

        // Still offline: nothing more happens.
        assert_eq!(
            h.supervisor.observe("alice", false).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(h.finalizer.calls(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_offline_produces_matching_archives() {
        use chanrec::config::FinalizeConfig;
        use chanrec::recorder::FfmpegFinalizer;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // Copies the input (6th argument) to the output (last argument).
        let ffmpeg = dir.path().join("fake-ffmpeg");
        std::fs::write(&ffmpeg, "#!/bin/sh\nfor last; do :; done\ncp \"$6\" \"$last\"\n").unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let channels_dir = dir.path().join("channels");
        let finalizer = FfmpegFinalizer::new(
            FinalizeConfig {
                ffmpeg_path: ffmpeg.to_string_lossy().into_owned(),
                output_format: "mp4".to_string(),
            },
            &channels_dir,
        );
        let feed = FakeFeed::with_messages(vec![
            ChatMessage::new("bob", "hello"),
            ChatMessage::new("carol", "gg"),
            ChatMessage::new("bob", "bye"),
        ]);
        let h = Harness::build(dir, feed, CountingFinalizer::new(Arc::new(finalizer)));

        h.supervisor.observe("alice", true).await.unwrap();
        let temp_dir = h.temp_dir();
        eventually("chat records", || {
            let temp_dir = temp_dir.clone();
            async move {
                files_with_extension(&temp_dir, "txt")
                    .first()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .is_some_and(|s| s.lines().count() == 3)
            }
        })
        .await;

        h.supervisor.observe("alice", false).await.unwrap();
        h.wait_for_state("alice", Some(ChannelState::Offline)).await;

        let streams = channels_dir.join("alice").join("streams");
        let videos = files_with_extension(&streams, "mp4");
        let chats = files_with_extension(&streams, "txt");
        assert_eq!(videos.len(), 1);
        assert_eq!(chats.len(), 1);
        assert_eq!(videos[0].file_stem(), chats[0].file_stem());
        assert_eq!(std::fs::read(&videos[0]).unwrap(), b"raw stream");

        let records: Vec<serde_json::Value> = std::fs::read_to_string(&chats[0])
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["channel"], "alice");
        assert_eq!(records[0]["sender"], "bob");
        assert_eq!(records[1]["text"], "gg");
        assert!(records[2]["timestamp"].is_string());

        // Nothing left behind in temp.
        assert!(files_with_extension(&h.temp_dir(), "ts").is_empty());
        assert!(files_with_extension(&h.temp_dir(), "txt").is_empty());
        assert_eq!(h.finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_waits_for_finalize() {
        let h = Harness::build(
            tempfile::tempdir().unwrap(),
            FakeFeed::default(),
            CountingFinalizer::gated(Arc::new(NoopFinalizer)),
        );
        h.supervisor.observe("alice", true).await.unwrap();

        let supervisor = h.supervisor.clone();
        let removal = tokio::spawn(async move { supervisor.remove("alice").await });

        h.wait_for_state("alice", Some(ChannelState::Finalizing)).await;
        let finalizer = h.finalizer.clone();
        eventually("finalize to begin", || {
            let finalizer = finalizer.clone();
            async move { finalizer.calls() == 1 }
        })
        .await;
        // Handles are released before finalize runs.
        assert_eq!(h.capture.running(), 0);
        assert_eq!(h.feed.active(), 0);
        assert!(!removal.is_finished());
        assert_eq!(h.supervisor.live_channels().await, vec!["alice"]);

        h.finalizer.release();
        let outcome = removal.await.unwrap().unwrap();

        assert_eq!(
            outcome,
            RemovalOutcome::Finalized(FinalizeOutcome::Archived(ArchivedPaths::default()))
        );
        assert_eq!(h.supervisor.state_of("alice").await, None);
        assert!(h.supervisor.tracked_channels().await.is_empty());
        assert_eq!(h.finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_channel() {
        let h = Harness::new();

        let err = h.supervisor.remove("unknown").await.unwrap_err();

        assert!(matches!(err, Error::UnknownChannel(name) if name == "unknown"));
        assert!(h.supervisor.tracked_channels().await.is_empty());
        assert!(!h.temp_dir().exists());
        assert_eq!(h.finalizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_idle_channel() {
        let h = Harness::new();
        h.supervisor.observe("alice", false).await.unwrap();
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Offline));

        let outcome = h.supervisor.remove("alice").await.unwrap();

        assert_eq!(outcome, RemovalOutcome::Idle);
        assert_eq!(h.supervisor.state_of("alice").await, None);
        assert_eq!(h.finalizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_racing_remove_finalizes_once() {
        let h = Harness::build(
            tempfile::tempdir().unwrap(),
            FakeFeed::default(),
            CountingFinalizer::gated(Arc::new(NoopFinalizer)),
        );
        h.supervisor.observe("alice", true).await.unwrap();

        assert_eq!(
            h.supervisor.observe("alice", false).await.unwrap(),
            Transition::Stopping
        );
        let supervisor = h.supervisor.clone();
        let removal = tokio::spawn(async move { supervisor.remove("alice").await });
        let supervisor = h.supervisor.clone();
        eventually("remove to register", || {
            let supervisor = supervisor.clone();
            async move { supervisor.removal_epoch().await == 1 }
        })
        .await;
        assert_eq!(
            h.supervisor.observe("alice", false).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Unchanged
        );

        h.finalizer.release();
        let outcome = removal.await.unwrap().unwrap();

        assert!(matches!(outcome, RemovalOutcome::Finalized(_)));
        assert_eq!(h.finalizer.calls(), 1);
        assert_eq!(h.capture.starts(), 1);
        assert_eq!(h.supervisor.state_of("alice").await, None);
    }

    #[tokio::test]
    async fn test_crash_is_an_implicit_offline() {
        let h = Harness::new();
        h.supervisor.observe("alice", true).await.unwrap();

        h.capture.crash("alice");
        let capture = h.capture.clone();
        eventually("capture to exit", || {
            let capture = capture.clone();
            async move { capture.running() == 0 }
        })
        .await;

        // The platform still reports live, but the capture is gone.
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Stopping
        );
        h.wait_for_state("alice", Some(ChannelState::Offline)).await;
        assert_eq!(h.finalizer.calls(), 1);
        assert_eq!(h.feed.active(), 0);

        // Next observation starts a fresh session.
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Started
        );
        assert_eq!(h.capture.starts(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_channel_offline() {
        let h = Harness::new();
        h.capture.fail_spawn.store(true, Ordering::SeqCst);

        let err = h.supervisor.observe("alice", true).await.unwrap_err();

        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Offline));
        assert!(h.supervisor.live_channels().await.is_empty());
        assert_eq!(h.feed.runs(), 0);

        h.capture.fail_spawn.store(false, Ordering::SeqCst);
        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Started
        );
    }

    #[tokio::test]
    async fn test_conversion_failure_keeps_raw_and_disposes_session() {
        let h = Harness::build(
            tempfile::tempdir().unwrap(),
            FakeFeed::default(),
            CountingFinalizer::new(Arc::new(FailingFinalizer)),
        );
        h.supervisor.observe("alice", true).await.unwrap();

        let supervisor = h.supervisor.clone();
        let removal = tokio::spawn(async move { supervisor.remove("alice").await });
        let outcome = removal.await.unwrap().unwrap();

        assert!(matches!(
            outcome,
            RemovalOutcome::Finalized(FinalizeOutcome::Failed(reason)) if reason.contains("exit code 1")
        ));
        assert_eq!(files_with_extension(&h.temp_dir(), "ts").len(), 1);
        assert_eq!(h.capture.running(), 0);
        assert_eq!(h.feed.active(), 0);
        assert!(h.supervisor.live_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_observation_after_remove_is_ignored() {
        let h = Harness::new();
        let listing = h.supervisor.begin_listing().await;
        h.supervisor
            .observe_listed("alice", true, &listing)
            .await
            .unwrap();

        h.supervisor.remove("alice").await.unwrap();

        // An iteration that listed the registry before the removal.
        assert_eq!(
            h.supervisor
                .observe_listed("alice", true, &listing)
                .await
                .unwrap(),
            Transition::Ignored
        );
        assert_eq!(h.supervisor.state_of("alice").await, None);
        drop(listing);

        // A later iteration is trusted again.
        let listing = h.supervisor.begin_listing().await;
        assert_eq!(
            h.supervisor
                .observe_listed("alice", true, &listing)
                .await
                .unwrap(),
            Transition::Started
        );
    }

    #[tokio::test]
    async fn test_retirements_are_pruned_once_no_listing_needs_them() {
        let h = Harness::new();
        let old = h.supervisor.begin_listing().await;

        for name in ["alice", "bob", "carol"] {
            h.supervisor.retire(name).await;
        }
        // Still needed by the open listing.
        assert_eq!(
            h.supervisor.retired_channels().await,
            vec!["alice", "bob", "carol"]
        );
        let newer = h.supervisor.begin_listing().await;
        assert_eq!(h.supervisor.retired_channels().await.len(), 3);

        drop(old);
        drop(newer);
        let current = h.supervisor.begin_listing().await;
        assert!(h.supervisor.retired_channels().await.is_empty());

        // With no listing open a retirement has nothing to guard against.
        drop(current);
        h.supervisor.retire("dave").await;
        assert!(h.supervisor.retired_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_chat_log_finalizes_session() {
        let h = Harness::build(
            tempfile::tempdir().unwrap(),
            FakeFeed::stopping_early(),
            CountingFinalizer::new(Arc::new(NoopFinalizer)),
        );
        h.supervisor.observe("alice", true).await.unwrap();

        // Capture is still running and the channel is still live.
        let supervisor = h.supervisor.clone();
        eventually("session to be torn down", || {
            let supervisor = supervisor.clone();
            async move { supervisor.observe("alice", true).await.unwrap() == Transition::Stopping }
        })
        .await;

        h.wait_for_state("alice", Some(ChannelState::Offline)).await;
        assert_eq!(h.finalizer.calls(), 1);
        assert_eq!(h.capture.running(), 0);
        assert!(h.supervisor.live_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_finalizes_every_session() {
        let h = Harness::new();
        h.supervisor.observe("alice", true).await.unwrap();
        h.supervisor.observe("bob", true).await.unwrap();
        h.supervisor.observe("carol", false).await.unwrap();

        let mut outcomes = h.supervisor.shutdown().await;
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let names: Vec<&str> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(outcomes.iter().all(|(_, o)| o.is_archived()));
        assert_eq!(h.finalizer.calls(), 2);
        assert_eq!(h.capture.running(), 0);
        assert_eq!(h.feed.active(), 0);
        assert!(h.supervisor.live_channels().await.is_empty());

        assert_eq!(
            h.supervisor.observe("alice", true).await.unwrap(),
            Transition::Ignored
        );
        assert_eq!(h.capture.starts(), 2);
    }
}

/// Status poller answering from a table; channels mapped to `None` fail.
///
/// A gated poller holds every answer until `release` is called.
struct FakePoller {
    answers: Mutex<HashMap<String, Option<bool>>>,
    calls: Mutex<HashMap<String, usize>>,
    gate: Semaphore,
}

impl Default for FakePoller {
    fn default() -> Self {
        Self {
            answers: Mutex::default(),
            calls: Mutex::default(),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }
}

impl FakePoller {
    fn gated() -> Self {
        Self {
            gate: Semaphore::new(0),
            ..Self::default()
        }
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn set(&self, channel: &str, answer: Option<bool>) {
        self.answers.lock().insert(channel.to_string(), answer);
    }

    fn calls(&self, channel: &str) -> usize {
        self.calls.lock().get(channel).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LiveStatusPoller for FakePoller {
    async fn is_live(&self, channel: &str) -> Result<bool> {
        *self.calls.lock().entry(channel.to_string()).or_default() += 1;
        let _permit = self.gate.acquire().await.unwrap();
        match self.answers.lock().get(channel).copied().flatten() {
            Some(live) => Ok(live),
            None => Err(Error::transient("connection reset")),
        }
    }
}

mod scheduler_tests {
    use super::*;

    fn scheduler(
        h: &Harness,
        registry: Arc<MemoryRegistry>,
        poller: Arc<FakePoller>,
    ) -> MonitorScheduler {
        MonitorScheduler::new(
            registry,
            poller,
            h.supervisor.clone(),
            Duration::from_millis(20),
            4,
        )
    }

    #[tokio::test]
    async fn test_poll_failure_is_isolated() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::with_channels(["alice", "bob"]));
        let poller = Arc::new(FakePoller::default());
        poller.set("alice", Some(true));
        poller.set("bob", None);
        let scheduler = scheduler(&h, registry, poller.clone());

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.started, 1);
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Live));
        assert_eq!(h.supervisor.state_of("bob").await, None);

        // bob is re-checked next tick.
        poller.set("bob", Some(true));
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.failed, 0);
        assert_eq!(report.started, 1);
        assert_eq!(poller.calls("bob"), 2);
        assert_eq!(h.supervisor.live_channels().await, vec!["alice", "bob"]);
        assert_eq!(h.capture.starts(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_live_channel_recording() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::with_channels(["alice"]));
        let poller = Arc::new(FakePoller::default());
        poller.set("alice", Some(true));
        let scheduler = scheduler(&h, registry, poller.clone());
        scheduler.tick().await.unwrap();

        poller.set("alice", None);
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.stopping, 0);
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Live));
        assert_eq!(h.finalizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_tick_stops_recording() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::with_channels(["alice"]));
        let poller = Arc::new(FakePoller::default());
        poller.set("alice", Some(true));
        let scheduler = scheduler(&h, registry, poller.clone());
        scheduler.tick().await.unwrap();

        poller.set("alice", Some(false));
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.stopping, 1);
        h.wait_for_state("alice", Some(ChannelState::Offline)).await;
        assert_eq!(h.finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_torn_down() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::with_channels(["alice"]));
        let poller = Arc::new(FakePoller::default());
        poller.set("alice", Some(true));
        let scheduler = scheduler(&h, registry.clone(), poller.clone());
        scheduler.tick().await.unwrap();

        registry.remove("alice").await.unwrap();
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.checked, 0);
        h.wait_for_state("alice", None).await;
        assert_eq!(h.finalizer.calls(), 1);
        assert_eq!(h.capture.running(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::with_channels(["alice"]));
        let poller = Arc::new(FakePoller::default());
        poller.set("alice", Some(false));
        let scheduler = scheduler(&h, registry, poller.clone());

        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        };
        let stopper = async {
            let poller = poller.clone();
            eventually("a few ticks", || {
                let poller = poller.clone();
                async move { poller.calls("alice") >= 2 }
            })
            .await;
            cancel.cancel();
        };

        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, stopper) })
            .await
            .unwrap();
        assert_eq!(h.supervisor.state_of("alice").await, Some(ChannelState::Offline));
    }
}

mod service_tests {
    use super::*;

    fn service(h: &Harness, registry: Arc<MemoryRegistry>) -> ChannelService {
        ChannelService::new(registry, h.supervisor.clone())
    }

    #[tokio::test]
    async fn test_delete_live_channel_finalizes_first() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::new());
        let service = service(&h, registry.clone());
        service.add("Alice").await.unwrap();
        h.supervisor.observe("alice", true).await.unwrap();

        let outcome = service.delete("alice").await.unwrap();

        assert!(matches!(outcome, Some(RemovalOutcome::Finalized(_))));
        assert_eq!(h.finalizer.calls(), 1);
        assert_eq!(h.capture.running(), 0);
        assert!(registry.list().await.unwrap().is_empty());
        assert_eq!(h.supervisor.state_of("alice").await, None);
    }

    #[tokio::test]
    async fn test_delete_errors() {
        let h = Harness::new();
        let service = service(&h, Arc::new(MemoryRegistry::with_channels(["alice"])));

        assert!(matches!(service.delete("").await, Err(Error::Validation(_))));
        assert!(matches!(
            service.delete("unknown").await,
            Err(Error::UnknownChannel(_))
        ));
        // Registered but never observed.
        assert_eq!(service.delete("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_readmits_removed_channel() {
        let h = Harness::new();
        let service = service(&h, Arc::new(MemoryRegistry::new()));
        service.add("alice").await.unwrap();
        let listing = h.supervisor.begin_listing().await;
        h.supervisor
            .observe_listed("alice", true, &listing)
            .await
            .unwrap();
        service.delete("alice").await.unwrap();

        service.add("alice").await.unwrap();

        assert_eq!(
            h.supervisor
                .observe_listed("alice", true, &listing)
                .await
                .unwrap(),
            Transition::Started
        );
    }

    #[tokio::test]
    async fn test_delete_during_poll_of_unobserved_channel() {
        let h = Harness::new();
        let registry = Arc::new(MemoryRegistry::new());
        let service = service(&h, registry.clone());
        service.add("alice").await.unwrap();

        let poller = Arc::new(FakePoller::gated());
        poller.set("alice", Some(true));
        let scheduler = MonitorScheduler::new(
            registry.clone(),
            poller.clone(),
            h.supervisor.clone(),
            Duration::from_millis(20),
            4,
        );

        let delete = async {
            let waiting = poller.clone();
            eventually("status check in flight", || {
                let waiting = waiting.clone();
                async move { waiting.calls("alice") == 1 }
            })
            .await;
            let outcome = service.delete("alice").await;
            poller.release();
            outcome
        };
        let (report, outcome) = tokio::join!(scheduler.tick(), delete);

        assert_eq!(outcome.unwrap(), None);
        assert_eq!(report.unwrap().started, 0);
        assert!(registry.list().await.unwrap().is_empty());
        assert_eq!(h.supervisor.state_of("alice").await, None);
        assert_eq!(h.capture.starts(), 0);
        assert_eq!(h.capture.running(), 0);
    }
}
