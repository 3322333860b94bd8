//! Twitch chat over IRC-on-WebSocket.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChatFeed, ChatMessage};
use crate::{Error, Result};

/// Twitch WebSocket IRC server URL
const TWITCH_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const BASE_RECONNECT_DELAY_MS: u64 = 1000;
const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

/// A parsed IRC line.
#[derive(Debug, PartialEq, Eq)]
enum IrcLine {
    Ping(String),
    Privmsg(ChatMessage),
    Other,
}

fn parse_irc_line(line: &str) -> IrcLine {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(payload) = line.strip_prefix("PING") {
        return IrcLine::Ping(payload.trim_start().trim_start_matches(':').to_string());
    }

    let mut tags = HashMap::new();
    let mut remaining = line;
    if let Some(tagged) = line.strip_prefix('@')
        && let Some((tag_str, rest)) = tagged.split_once(' ')
    {
        for tag in tag_str.split(';') {
            if let Some((key, value)) = tag.split_once('=') {
                tags.insert(key, value);
            }
        }
        remaining = rest;
    }

    // :user!user@user.tmi.twitch.tv PRIVMSG #channel :message
    let parts: Vec<&str> = remaining.splitn(4, ' ').collect();
    if parts.len() < 4 || parts[1] != "PRIVMSG" {
        return IrcLine::Other;
    }

    let login = parts[0]
        .strip_prefix(':')
        .and_then(|s| s.split('!').next())
        .unwrap_or("unknown");
    let sender = tags
        .get("display-name")
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .unwrap_or_else(|| login.to_string());
    let text = parts[3].strip_prefix(':').unwrap_or(parts[3]);

    IrcLine::Privmsg(ChatMessage::new(sender, text))
}

/// Reads a channel's chat from Twitch IRC, reconnecting with backoff until
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct TwitchIrcFeed {
    oauth_token: Option<String>,
    nickname: Option<String>,
}

impl TwitchIrcFeed {
    /// Anonymous, read-only connection.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Authenticated connection. Empty values fall back to anonymous access.
    pub fn new(oauth_token: impl Into<String>, nickname: impl Into<String>) -> Self {
        let oauth_token = oauth_token.into();
        let nickname = nickname.into();
        Self {
            oauth_token: (!oauth_token.trim().is_empty()).then_some(oauth_token),
            nickname: (!nickname.trim().is_empty()).then_some(nickname),
        }
    }

    fn handshake(&self, channel: &str) -> Vec<String> {
        let pass = match &self.oauth_token {
            Some(token) if token.starts_with("oauth:") => format!("PASS {token}"),
            Some(token) => format!("PASS oauth:{token}"),
            None => "PASS oauth:".to_string(),
        };
        // An authenticated nick must match the token owner.
        let nick = match (&self.oauth_token, &self.nickname) {
            (Some(_), Some(nick)) => nick.to_lowercase(),
            _ => format!("justinfan{}", rand::random::<u32>() % 100000),
        };

        vec![
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
            pass,
            format!("NICK {nick}"),
            format!("JOIN #{}", channel.to_lowercase()),
        ]
    }
}

/// How a connection ended when it was not a failure.
enum Disconnect {
    Cancelled,
    /// The log writer is gone; nothing left to feed.
    WriterGone,
}

impl TwitchIrcFeed {
    /// One connection: connect, join, then pump messages until it ends.
    ///
    /// `delay` is reset once the handshake has gone through.
    async fn serve(
        &self,
        channel: &str,
        tx: &mpsc::Sender<ChatMessage>,
        cancel: &CancellationToken,
        delay: &mut u64,
    ) -> Result<Disconnect> {
        let (mut stream, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Disconnect::Cancelled),
            result = connect_async(TWITCH_WS_URL) => result?,
        };
        info!(channel = %channel, "Connected to chat");

        for line in self.handshake(channel) {
            stream.send(Message::Text(line.into())).await?;
        }
        *delay = BASE_RECONNECT_DELAY_MS;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return Ok(Disconnect::Cancelled);
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        for line in text.as_str().lines() {
                            match parse_irc_line(line) {
                                IrcLine::Ping(payload) => {
                                    trace!(channel = %channel, "PING");
                                    let pong = format!("PONG :{payload}");
                                    stream.send(Message::Text(pong.into())).await?;
                                }
                                IrcLine::Privmsg(message) => {
                                    if tx.send(message).await.is_err() {
                                        let _ = stream.close(None).await;
                                        return Ok(Disconnect::WriterGone);
                                    }
                                }
                                IrcLine::Other => {}
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(channel = %channel, ?frame, "Chat server closed the connection");
                        return Err(Error::chat("server closed the connection"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::chat("stream ended")),
                }
            }
        }
    }
}

#[async_trait]
impl ChatFeed for TwitchIrcFeed {
    async fn run(
        &self,
        channel: &str,
        tx: mpsc::Sender<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut delay = BASE_RECONNECT_DELAY_MS;

        loop {
            match self.serve(channel, &tx, &cancel, &mut delay).await {
                Ok(Disconnect::Cancelled) => return Ok(()),
                Ok(Disconnect::WriterGone) => {
                    debug!(channel = %channel, "Chat log closed, leaving chat");
                    return Ok(());
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, retry_ms = delay, "Chat connection lost");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY_MS);
        }
    }
}
