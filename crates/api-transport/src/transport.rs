//! Bearer injection and the 401 refresh-and-retry path
//!
//! Every call goes out with `Authorization: Bearer <access token>` when a
//! token is stored. No expiry check happens here; proactive refresh is the
//! token manager's job. This path only reacts to 401 responses:
//!
//! 1. Response is 401 and the request has not been retried → mark it
//!    retried, refresh the session, re-send it verbatim with the new token
//! 2. Refresh fails → the refresh error is returned, not the 401
//! 3. Any other error status (or a 401 on the retry) → reported and returned
//!
//! So each logical call makes at most two network attempts.

use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_auth::TokenManager;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::reporter::ErrorReporter;

/// One logical API call, carried unchanged across the retry.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| Error::InvalidRequest(format!("unserializable body: {e}")))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Whether this request is already the one permitted retry.
    pub fn is_retry(&self) -> bool {
        self.retried
    }
}

/// HTTP client that keeps requests authorized.
pub struct AuthenticatedTransport {
    client: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    reporter: Arc<dyn ErrorReporter>,
}

impl AuthenticatedTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: TokenManager,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            reporter,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |req, (k, v)| req.query(*k, v));
        self.send(request).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::put(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Execute `request` and deserialize the JSON body.
    ///
    /// An empty body deserializes from JSON `null`, so `()` and `Option<_>`
    /// work for endpoints that return nothing.
    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.execute(request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.fail(Error::Http(format!("reading response body: {e}"))))?;

        let parsed = if bytes.is_empty() {
            serde_json::from_value(Value::Null)
        } else {
            serde_json::from_slice(&bytes)
        };
        parsed.map_err(|e| self.fail(Error::Decode(e.to_string())))
    }

    /// Execute `request` with the retry-once policy and return the raw
    /// successful response.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, mut request: ApiRequest) -> Result<reqwest::Response> {
        loop {
            let response = self.dispatch(&request).await.map_err(|e| self.fail(e))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !request.retried {
                request.retried = true;
                debug!("401 from server, refreshing session and retrying once");
                metrics::counter!("transport_retries_total").increment(1);
                match self.tokens.refresh_token().await {
                    Ok(_) => continue,
                    Err(e) => return Err(self.fail(Error::Refresh(e))),
                }
            }

            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(self.fail(Error::Status {
                    status: status.as_u16(),
                    body,
                }));
            }

            return Ok(response);
        }
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|e| Error::InvalidRequest(format!("bad URL for {}: {e}", request.path)))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(token) = self.tokens.get_access_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("{} {} failed: {e}", request.method, request.path)))
    }

    fn fail(&self, err: Error) -> Error {
        self.reporter.report(&err);
        err
    }
}
