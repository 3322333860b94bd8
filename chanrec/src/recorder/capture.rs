//! Stream capture through an external tool (streamlink).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::utils::fs;
use crate::{Error, Result};
use process_utils::ExitKind;

/// Liveness of a capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Running,
    /// Ended normally or because `stop` was requested.
    Exited,
    /// Ended on its own with a failure.
    Crashed,
}

impl CaptureStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Owned handle to a running capture.
///
/// The process is driven by a background task; the handle only requests
/// termination and observes the outcome.
pub struct CaptureHandle {
    channel: String,
    output_path: PathBuf,
    cancel: CancellationToken,
    status: watch::Receiver<CaptureStatus>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Assemble a handle from the pieces a [`StreamCapture`] implementation owns.
    ///
    /// `task` must publish a terminal status on `status` and return once
    /// `cancel` fires.
    pub fn new(
        channel: impl Into<String>,
        output_path: impl Into<PathBuf>,
        cancel: CancellationToken,
        status: watch::Receiver<CaptureStatus>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            channel: channel.into(),
            output_path: output_path.into(),
            cancel,
            status,
            task: Some(task),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        *self.status.borrow()
    }

    /// Request termination and wait for the process to be reaped.
    ///
    /// Stopping an already stopped handle is a no-op.
    pub async fn stop(&mut self) -> CaptureStatus {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(channel = %self.channel, error = %e, "Capture task panicked");
        }
        let status = self.status();
        debug!(channel = %self.channel, path = %self.output_path.display(), ?status, "Capture stopped");
        status
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        // The task owns the child with kill_on_drop; cancelling lets it reap.
        self.cancel.cancel();
    }
}

/// Starts captures. `start` returns as soon as the process is launched.
#[async_trait]
pub trait StreamCapture: Send + Sync {
    /// Fails with [`Error::ProcessSpawn`] when the tool cannot be launched.
    async fn start(&self, channel: &str, output_path: &Path) -> Result<CaptureHandle>;
}

/// Status lines of interest in streamlink's log output.
#[derive(Debug, PartialEq, Eq)]
enum StreamlinkStatus {
    StreamOpened,
    StreamEnded,
    Error(String),
}

fn parse_streamlink_output(line: &str) -> Option<StreamlinkStatus> {
    if line.contains("[cli][info] Stream ended") {
        return Some(StreamlinkStatus::StreamEnded);
    }
    if line.contains("[cli][info] Opening stream") {
        return Some(StreamlinkStatus::StreamOpened);
    }
    if line.contains("[cli][error]") || line.contains("error: ") {
        return Some(StreamlinkStatus::Error(line.to_string()));
    }
    None
}

/// Captures `https://www.twitch.tv/<channel>` with streamlink.
pub struct StreamlinkCapture {
    config: CaptureConfig,
}

impl StreamlinkCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, channel: &str, output_path: &Path) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.push(format!("https://www.twitch.tv/{channel}"));
        args.push(self.config.quality.clone());
        args.push("-o".to_string());
        args.push(output_path.to_string_lossy().into_owned());
        args.push("--force".to_string());
        args
    }
}

#[async_trait]
impl StreamCapture for StreamlinkCapture {
    async fn start(&self, channel: &str, output_path: &Path) -> Result<CaptureHandle> {
        fs::ensure_parent_dir(output_path).await?;

        let args = self.build_args(channel, output_path);
        info!(channel = %channel, path = %output_path.display(), "Starting capture");
        debug!(channel = %channel, ?args, "streamlink arguments");

        let mut child = process_utils::tokio_command(&self.config.streamlink_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(&self.config.streamlink_path, e))?;

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(CaptureStatus::Running);

        // streamlink logs to stderr when writing the stream to a file.
        if let Some(stderr) = child.stderr.take() {
            let channel = channel.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => match parse_streamlink_output(&line) {
                            Some(StreamlinkStatus::StreamOpened) => {
                                info!(channel = %channel, "Capture stream opened")
                            }
                            Some(StreamlinkStatus::StreamEnded) => {
                                info!(channel = %channel, "Capture stream ended")
                            }
                            Some(StreamlinkStatus::Error(err)) => {
                                warn!(channel = %channel, "streamlink: {}", err)
                            }
                            None => debug!(channel = %channel, "streamlink: {}", line),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            debug!(channel = %channel, error = %e, "Error reading streamlink stderr");
                            break;
                        }
                    }
                }
            });
        }

        let stop_timeout = self.config.stop_timeout();
        let task_cancel = cancel.clone();
        let task_channel = channel.to_string();
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                exit = child.wait() => match exit {
                    Ok(exit) => classify_unrequested_exit(ExitKind::from(exit)),
                    Err(e) => {
                        error!(channel = %task_channel, error = %e, "Error waiting for streamlink");
                        CaptureStatus::Crashed
                    }
                },
                _ = task_cancel.cancelled() => {
                    debug!(channel = %task_channel, "Stop requested, terminating streamlink");
                    if process_utils::terminate(&mut child, stop_timeout).await.is_none() {
                        warn!(channel = %task_channel, "streamlink could not be reaped");
                    }
                    CaptureStatus::Exited
                }
            };
            debug!(channel = %task_channel, ?status, "Capture process finished");
            let _ = status_tx.send(status);
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

fn classify_unrequested_exit(kind: ExitKind) -> CaptureStatus {
    if kind.is_success() {
        CaptureStatus::Exited
    } else {
        CaptureStatus::Crashed
    }
}
