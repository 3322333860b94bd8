//! Turns a finished capture into archived artifacts.
//!
//! The raw stream is remuxed with ffmpeg (streams copied, never re-encoded)
//! into `<channels_dir>/<channel>/streams/<timestamp>.<format>`; the chat log
//! is moved next to it as `<timestamp>.txt`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::config::FinalizeConfig;
use crate::utils::fs;
use crate::{Error, Result};

/// Timestamp format shared by both artifacts of a session.
const STEM_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Where a session's artifacts ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivedPaths {
    /// `None` when nothing was captured.
    pub video: Option<PathBuf>,
    /// `None` when no chat log existed.
    pub chat: Option<PathBuf>,
}

#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Archive one session's raw capture and chat log.
    ///
    /// Fails with [`Error::Conversion`] when the conversion tool fails; the
    /// raw file is then left where it is.
    async fn finalize(&self, channel: &str, raw_path: &Path, chat_path: &Path)
    -> Result<ArchivedPaths>;
}

pub struct FfmpegFinalizer {
    config: FinalizeConfig,
    channels_dir: PathBuf,
}

impl FfmpegFinalizer {
    pub fn new(config: FinalizeConfig, channels_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            channels_dir: channels_dir.into(),
        }
    }

    /// `<channels_dir>/<channel>/streams`
    pub fn streams_dir(&self, channel: &str) -> PathBuf {
        self.channels_dir.join(channel).join("streams")
    }

    fn build_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let args = Self::build_args(input, output);
        debug!(?args, "FFmpeg args");

        let command_output = process_utils::tokio_command(&self.config.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::conversion(
                    input,
                    format!("failed to launch {}: {e}", self.config.ffmpeg_path),
                )
            })?;

        if !command_output.status.success() {
            let stderr = String::from_utf8_lossy(&command_output.stderr);
            let error_msg = stderr
                .lines()
                .rfind(|l| !l.trim().is_empty())
                .unwrap_or("Unknown ffmpeg error");
            return Err(Error::conversion(
                input,
                format!(
                    "ffmpeg failed with exit code {}: {}",
                    command_output.status.code().unwrap_or(-1),
                    error_msg
                ),
            ));
        }

        Ok(())
    }
}

/// Pick a stem not yet used by either artifact in `dir`.
async fn unique_stem(dir: &Path, now: DateTime<Local>, video_ext: &str) -> String {
    let base = now.format(STEM_FORMAT).to_string();
    let mut stem = base.clone();
    let mut n = 1;
    loop {
        let video_taken = path_exists(&dir.join(format!("{stem}.{video_ext}"))).await;
        let chat_taken = path_exists(&dir.join(format!("{stem}.txt"))).await;
        if !video_taken && !chat_taken {
            return stem;
        }
        stem = format!("{base}-{n}");
        n += 1;
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Size of `path`, or `None` when it does not exist.
async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[async_trait]
impl Finalizer for FfmpegFinalizer {
    async fn finalize(
        &self,
        channel: &str,
        raw_path: &Path,
        chat_path: &Path,
    ) -> Result<ArchivedPaths> {
        let dir = self.streams_dir(channel);
        fs::ensure_dir_all_with_op("creating channel storage", &dir).await?;

        let stem = unique_stem(&dir, Local::now(), &self.config.output_format).await;
        let mut archived = ArchivedPaths::default();

        match file_len(raw_path).await {
            Some(len) if len > 0 => {
                let output = dir.join(format!("{stem}.{}", self.config.output_format));
                info!(
                    channel = %channel,
                    input = %raw_path.display(),
                    output = %output.display(),
                    "Converting capture"
                );

                if let Err(e) = self.convert(raw_path, &output).await {
                    if path_exists(&output).await
                        && let Err(remove_err) = tokio::fs::remove_file(&output).await
                    {
                        warn!(path = %output.display(), error = %remove_err, "Failed to remove partial output");
                    }
                    return Err(e);
                }

                match tokio::fs::remove_file(raw_path).await {
                    Ok(()) => debug!(path = %raw_path.display(), "Removed raw capture"),
                    Err(e) => {
                        warn!(path = %raw_path.display(), error = %e, "Failed to remove raw capture")
                    }
                }
                archived.video = Some(output);
            }
            Some(_) => {
                // The stream never produced data.
                debug!(channel = %channel, path = %raw_path.display(), "Discarding empty capture");
                let _ = tokio::fs::remove_file(raw_path).await;
            }
            None => {
                warn!(channel = %channel, path = %raw_path.display(), "No capture file to convert");
            }
        }

        if path_exists(chat_path).await {
            let dest = dir.join(format!("{stem}.txt"));
            fs::move_file(chat_path, &dest).await?;
            archived.chat = Some(dest);
        }

        info!(channel = %channel, ?archived, "Session archived");
        Ok(archived)
    }
}
