//! Access tokens for the routing API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::TokenError;

/// Source of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return an access token, bypassing any cache when `force_refresh` is set.
    async fn fetch_token(&self, force_refresh: bool) -> Result<String, TokenError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 client-credentials token source.
pub struct OAuthTokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: tokio::sync::Mutex<Option<String>>,
}

impl OAuthTokenSource {
    /// Create a token source for `{oauth_url}/oauth/token`.
    pub fn new(
        oauth_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .user_agent("rtreg-route-registrar/0.1.0")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            token_url: format!("{}/oauth/token", oauth_url.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: tokio::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch_token(&self, force_refresh: bool) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }

        debug!(url = %self.token_url, force_refresh, "Fetching routing api token");

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status { status, body });
        }

        let token: TokenResponse = response.json().await?;
        *cached = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

/// Token source handing out numbered tokens, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockTokenSource {
    fetches: AtomicUsize,
    forced: AtomicUsize,
    fail: AtomicBool,
}

impl MockTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent fetch fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Total fetches.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches that asked for a forced refresh.
    pub fn forced_count(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for MockTokenSource {
    async fn fetch_token(&self, force_refresh: bool) -> Result<String, TokenError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TokenError::Status {
                status: 401,
                body: "[MOCK] unauthorized".to_string(),
            });
        }
        Ok(format!("token-{n}"))
    }
}
