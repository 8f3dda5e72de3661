//! Token refresh RPC
//!
//! `AuthApi` is the seam between the token manager and the network. The
//! HTTP implementation POSTs `{refreshToken}` to `/auth/refresh` and expects
//! a new `{accessToken, refreshToken}` pair back.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::constants::REFRESH_PATH;
use crate::error::{Error, Result};

/// An access/refresh token pair. Both values are opaque strings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Body of a refresh request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Some deployments wrap the pair in a `data` envelope; accept both shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Enveloped { data: TokenPair },
    Bare(TokenPair),
}

impl From<RefreshResponse> for TokenPair {
    fn from(response: RefreshResponse) -> Self {
        match response {
            RefreshResponse::Enveloped { data } => data,
            RefreshResponse::Bare(pair) => pair,
        }
    }
}

/// Exchanges a refresh token for a new token pair.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AuthApi>`).
pub trait AuthApi: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>>;
}

/// `AuthApi` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the refresh token is revoked or expired
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "refresh endpoint returned {status}: {body}"
                )));
            }
            return Err(Error::RefreshFailed(format!(
                "refresh endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<RefreshResponse>()
            .await
            .map(TokenPair::from)
            .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))
    }
}

impl AuthApi for HttpAuthApi {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>> {
        Box::pin(self.post_refresh(refresh_token))
    }
}
