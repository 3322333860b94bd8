//! Twitch app access token (client-credentials grant).

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::{Error, Result};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// App access token used as the bearer credential for Helix requests.
///
/// The token is fetched once at startup and refreshed only when the API
/// rejects it.
pub struct AppToken {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: RwLock<String>,
}

impl AppToken {
    /// Exchange the client credentials for a token.
    pub async fn fetch(
        client: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let this = Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: RwLock::new(String::new()),
        };
        this.refresh().await?;
        Ok(this)
    }

    /// Wrap an already issued token.
    pub fn from_token(
        client: reqwest::Client,
        client_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: String::new(),
            token: RwLock::new(token.into()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn bearer(&self) -> String {
        self.token.read().clone()
    }

    /// Request a fresh token and replace the current one.
    pub async fn refresh(&self) -> Result<()> {
        if self.client_secret.is_empty() {
            return Err(Error::config(
                "cannot refresh app token without twitch.client_secret",
            ));
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| Error::transient(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(format!(
                "token request rejected with status {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("malformed token response: {e}")))?;

        info!(expires_in = ?body.expires_in, "Obtained Twitch app access token");
        *self.token.write() = body.access_token;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parse() {
        let body: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","expires_in":5011271,"token_type":"bearer"}"#,
        )
        .unwrap();
        assert_eq!(body.access_token, "abc");
        assert_eq!(body.expires_in, Some(5011271));
    }

    #[tokio::test]
    async fn test_issued_token_cannot_refresh_without_secret() {
        crate::utils::http_client::install_rustls_provider();
        let token = AppToken::from_token(reqwest::Client::new(), "client", "issued");
        assert_eq!(token.client_id(), "client");
        assert_eq!(token.bearer(), "issued");

        let err = token.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(token.bearer(), "issued");
    }
}
