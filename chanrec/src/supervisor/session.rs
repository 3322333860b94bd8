//! One continuous live period of one channel.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::recorder::{ArchivedPaths, CaptureHandle, CaptureStatus, ChatSubscription, Finalizer};

/// Result of finalizing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Archived(ArchivedPaths),
    /// Finalize failed; on-disk artifacts were left in place.
    Failed(String),
}

impl FinalizeOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, Self::Archived(_))
    }
}

/// Raw capture and chat log paths for a session starting at `started_at`.
///
/// The start time is part of the name so a raw file preserved by a failed
/// conversion is never reused by the next session.
pub fn session_paths(temp_dir: &Path, channel: &str, started_at: DateTime<Utc>) -> (PathBuf, PathBuf) {
    let stem = format!("{channel}-{}", started_at.timestamp_millis());
    (
        temp_dir.join(format!("{stem}.ts")),
        temp_dir.join(format!("{stem}.txt")),
    )
}

/// A running recording. Owns both handles; they are only ever torn down
/// together by [`RecordingSession::teardown`].
pub struct RecordingSession {
    id: Uuid,
    channel: String,
    started_at: DateTime<Utc>,
    raw_path: PathBuf,
    chat_path: PathBuf,
    capture: CaptureHandle,
    chat: ChatSubscription,
}

impl RecordingSession {
    pub(crate) fn new(
        channel: &str,
        started_at: DateTime<Utc>,
        raw_path: PathBuf,
        chat_path: PathBuf,
        capture: CaptureHandle,
        chat: ChatSubscription,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            started_at,
            raw_path,
            chat_path,
            capture,
            chat,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.capture.status()
    }

    /// Whether the chat log is still being written.
    pub fn chat_active(&self) -> bool {
        self.chat.is_active()
    }

    /// Stop chat, then capture, then finalize. Consumes the session.
    pub(crate) async fn teardown(mut self, finalizer: &dyn Finalizer) -> FinalizeOutcome {
        let written = self.chat.cancel().await;
        let status = self.capture.stop().await;
        debug!(
            channel = %self.channel,
            session_id = %self.id,
            chat_records = written,
            ?status,
            "Session handles released"
        );

        let outcome = match finalizer
            .finalize(&self.channel, &self.raw_path, &self.chat_path)
            .await
        {
            Ok(paths) => FinalizeOutcome::Archived(paths),
            Err(e) => {
                error!(
                    channel = %self.channel,
                    session_id = %self.id,
                    raw_path = %self.raw_path.display(),
                    error = %e,
                    "Finalize failed, raw artifacts kept for manual recovery"
                );
                FinalizeOutcome::Failed(e.to_string())
            }
        };

        let duration = Utc::now() - self.started_at;
        info!(
            channel = %self.channel,
            session_id = %self.id,
            duration_secs = duration.num_seconds(),
            archived = outcome.is_archived(),
            "Session disposed"
        );
        outcome
    }
}
