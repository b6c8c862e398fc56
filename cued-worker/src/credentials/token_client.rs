//! OAuth2 refresh-token exchange against the Spotify accounts service

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{CredentialError, RefreshedToken, TokenExchange};

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// `grant_type=refresh_token` client (public PKCE client, no secret)
pub struct SpotifyTokenClient {
    http_client: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl SpotifyTokenClient {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            token_url: token_url.into(),
            client_id: client_id.into(),
        })
    }
}

fn parse_token_response(body: &str) -> Result<RefreshedToken, CredentialError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| CredentialError::Parse(e.to_string()))?;

    Ok(RefreshedToken {
        access_token: parsed.access_token,
        expires_in: parsed.expires_in,
        refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
    })
}

#[async_trait]
impl TokenExchange for SpotifyTokenClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        tracing::debug!(url = %self.token_url, "Exchanging refresh token");

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(CredentialError::Exchange(status.as_u16(), body));
        }

        parse_token_response(&body)
    }
}
