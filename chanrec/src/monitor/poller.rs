//! Live status checks against the Twitch Helix API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::auth::AppToken;
use crate::{Error, Result};

const HELIX_STREAMS_URL: &str = "https://api.twitch.tv/helix/streams";

/// Answers whether a channel is broadcasting right now.
///
/// Every call is an independent query; implementations do not cache.
#[async_trait]
pub trait LiveStatusPoller: Send + Sync {
    /// Fails with [`Error::TransientNetwork`] when the platform cannot be
    /// reached or answers with unusable data.
    async fn is_live(&self, channel: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    data: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    #[serde(rename = "type")]
    stream_type: String,
}

/// Parse a `GET /helix/streams` body.
///
/// Live iff the list is non-empty and its first entry has type `live`.
fn parse_streams_response(body: &[u8]) -> Result<bool> {
    let response: StreamsResponse = serde_json::from_slice(body)
        .map_err(|e| Error::transient(format!("malformed streams response: {e}")))?;
    Ok(response
        .data
        .first()
        .is_some_and(|entry| entry.stream_type == "live"))
}

pub struct HelixPoller {
    client: reqwest::Client,
    token: Arc<AppToken>,
}

impl HelixPoller {
    pub fn new(client: reqwest::Client, token: Arc<AppToken>) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl LiveStatusPoller for HelixPoller {
    async fn is_live(&self, channel: &str) -> Result<bool> {
        let response = self
            .client
            .get(HELIX_STREAMS_URL)
            .query(&[("user_login", channel)])
            .header("Client-ID", self.token.client_id())
            .bearer_auth(self.token.bearer())
            .send()
            .await
            .map_err(|e| Error::transient(format!("streams request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!(channel = %channel, "App token rejected, refreshing");
            self.token.refresh().await?;
            return Err(Error::transient("app token expired; refreshed for next check"));
        }
        if !status.is_success() {
            return Err(Error::transient(format!(
                "streams request returned status {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transient(format!("failed to read streams response: {e}")))?;
        let live = parse_streams_response(&body)?;
        debug!(channel = %channel, live, "Status checked");
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_live() {
        let body = br#"{"data":[{"id":"1","user_login":"alice","type":"live","title":"hi"}],"pagination":{}}"#;
        assert!(parse_streams_response(body).unwrap());
    }

    #[test]
    fn test_parse_offline() {
        let body = br#"{"data":[],"pagination":{}}"#;
        assert!(!parse_streams_response(body).unwrap());
    }

    #[test]
    fn test_parse_non_live_type() {
        // Anything other than "live" counts as offline.
        let body = br#"{"data":[{"type":""}]}"#;
        assert!(!parse_streams_response(body).unwrap());
    }

    #[test]
    fn test_parse_malformed_is_transient() {
        let err = parse_streams_response(br#"{"error":"Unauthorized"}"#).unwrap_err();
        assert!(matches!(err, Error::TransientNetwork(_)));
        assert!(err.is_transient());

        let err = parse_streams_response(b"<html>").unwrap_err();
        assert!(matches!(err, Error::TransientNetwork(_)));
    }
}
