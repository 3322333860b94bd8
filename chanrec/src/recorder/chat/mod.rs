//! Chat logging.
//!
//! A [`ChatFeed`] pushes messages into a bounded channel; a dedicated writer
//! task drains the channel into an append-only JSON-lines file, flushing each
//! record before taking the next one.

mod twitch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::utils::fs;
use crate::{Error, Result};

pub use twitch::TwitchIrcFeed;

/// Default capacity of the message channel between a feed and its writer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long `cancel` waits for a feed to notice cancellation before aborting it.
const FEED_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A message as delivered by a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// One line of a chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Source of chat messages for one channel.
#[async_trait]
pub trait ChatFeed: Send + Sync + 'static {
    /// Deliver messages for `channel` into `tx` until `cancel` fires or the
    /// receiver goes away.
    ///
    /// Returning early (with or without an error) ends the subscription's
    /// intake; the log file stays valid.
    async fn run(
        &self,
        channel: &str,
        tx: mpsc::Sender<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Starts chat subscriptions backed by a feed.
#[derive(Clone)]
pub struct ChatRecorder {
    feed: Arc<dyn ChatFeed>,
    capacity: usize,
}

impl ChatRecorder {
    pub fn new(feed: Arc<dyn ChatFeed>) -> Self {
        Self {
            feed,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Open `output_path` for appending and start the feed.
    pub async fn start(&self, channel: &str, output_path: &Path) -> Result<ChatSubscription> {
        fs::ensure_parent_dir(output_path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_path)
            .await
            .map_err(|e| Error::io_path("opening chat log", output_path, e))?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();

        let feed = self.feed.clone();
        let feed_channel = channel.to_string();
        let feed_cancel = cancel.clone();
        let feed_task = tokio::spawn(async move {
            if let Err(e) = feed.run(&feed_channel, tx, feed_cancel).await {
                warn!(channel = %feed_channel, error = %e, "Chat feed ended with error");
            }
        });

        let writer_task = tokio::spawn(write_records(
            channel.to_string(),
            output_path.to_path_buf(),
            file,
            rx,
        ));

        info!(channel = %channel, path = %output_path.display(), "Chat subscription started");

        Ok(ChatSubscription {
            channel: channel.to_string(),
            output_path: output_path.to_path_buf(),
            cancel,
            feed_task: Some(feed_task),
            writer_task: Some(writer_task),
        })
    }
}

/// Drain `rx` into `file`, one flushed JSON line per message.
///
/// Returns the number of records written. Exits when every sender is gone or
/// a write fails.
async fn write_records(
    channel: String,
    path: PathBuf,
    mut file: File,
    mut rx: mpsc::Receiver<ChatMessage>,
) -> u64 {
    let mut written = 0;

    while let Some(message) = rx.recv().await {
        let record = ChatRecord {
            channel: channel.clone(),
            sender: message.sender,
            text: message.text,
            timestamp: Utc::now(),
        };

        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping unserializable chat record");
                continue;
            }
        };
        line.push(b'\n');

        let result: std::io::Result<()> = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            error!(channel = %channel, path = %path.display(), error = %e, "Failed to write chat log");
            break;
        }
        written += 1;
    }

    // Stop intake before the file is closed.
    rx.close();
    if let Err(e) = file.sync_all().await {
        debug!(channel = %channel, error = %e, "Failed to sync chat log");
    }

    written
}

/// Handle to a running chat subscription.
pub struct ChatSubscription {
    channel: String,
    output_path: PathBuf,
    cancel: CancellationToken,
    feed_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<u64>>,
}

impl ChatSubscription {
    /// Whether the writer is still accepting messages.
    pub fn is_active(&self) -> bool {
        self.writer_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Unsubscribe and wait for the writer to drain.
    ///
    /// Messages already in the channel are written; nothing is written after
    /// this returns. Cancelling twice is a no-op. Returns the number of records
    /// written by the subscription (zero on repeated calls).
    pub async fn cancel(&mut self) -> u64 {
        self.cancel.cancel();

        if let Some(mut feed_task) = self.feed_task.take() {
            match tokio::time::timeout(FEED_STOP_TIMEOUT, &mut feed_task).await {
                Ok(Err(e)) if e.is_panic() => {
                    error!(channel = %self.channel, "Chat feed task panicked");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(channel = %self.channel, "Chat feed did not stop in time, aborting");
                    feed_task.abort();
                    let _ = feed_task.await;
                }
            }
        }

        let Some(writer_task) = self.writer_task.take() else {
            return 0;
        };
        match writer_task.await {
            Ok(written) => {
                debug!(
                    channel = %self.channel,
                    path = %self.output_path.display(),
                    written,
                    "Chat subscription closed"
                );
                written
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Chat writer task failed");
                0
            }
        }
    }
}

impl Drop for ChatSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
