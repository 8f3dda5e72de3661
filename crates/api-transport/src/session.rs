//! Login, registration, the current-user lookup and the health check
//!
//! Successful login/register hands the returned pair to the token manager,
//! which persists it and schedules the proactive refresh.

use std::sync::Arc;

use common::Secret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use session_auth::{
    CURRENT_USER_PATH, HEALTH_PATH, LOGIN_PATH, REGISTER_PATH, TokenManager, TokenPair,
};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::transport::AuthenticatedTransport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body returned by `/auth/login` and `/auth/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

/// Some deployments wrap payloads in a `data` envelope; accept both shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

pub struct AuthService {
    transport: Arc<AuthenticatedTransport>,
}

impl AuthService {
    pub fn new(transport: Arc<AuthenticatedTransport>) -> Self {
        Self { transport }
    }

    fn tokens(&self) -> &TokenManager {
        self.transport.tokens()
    }

    pub async fn login(&self, email: &str, password: &Secret<String>) -> Result<AuthResponse> {
        self.authenticate(LOGIN_PATH, email, password)
            .await
            .map_err(|e| {
                error!(email, error = %e, "login failed");
                Error::Authentication("login failed".into())
            })
    }

    pub async fn register(&self, email: &str, password: &Secret<String>) -> Result<AuthResponse> {
        self.authenticate(REGISTER_PATH, email, password)
            .await
            .map_err(|e| {
                error!(email, error = %e, "registration failed");
                Error::Authentication("registration failed".into())
            })
    }

    async fn authenticate(
        &self,
        path: &str,
        email: &str,
        password: &Secret<String>,
    ) -> Result<AuthResponse> {
        let body = json!({ "email": email, "password": password.expose() });
        let response: AuthResponse = self.post_enveloped(path, &body).await?;
        self.tokens()
            .set_tokens(&response.tokens.access_token, &response.tokens.refresh_token);
        info!(user_id = %response.user.id, "session established");
        Ok(response)
    }

    async fn post_enveloped<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let envelope: Envelope<T> = self.transport.post(path, body).await?;
        Ok(envelope.into_inner())
    }

    pub fn logout(&self) {
        self.tokens().clear_tokens();
        info!("logged out");
    }

    /// The signed-in user, or `None` when the lookup fails for any reason.
    pub async fn current_user(&self) -> Option<User> {
        match self
            .transport
            .get::<Envelope<User>>(CURRENT_USER_PATH, &[])
            .await
        {
            Ok(envelope) => Some(envelope.into_inner()),
            Err(_) => None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.tokens().has_valid_access_token()
    }

    /// Backend status from `GET /health`, body returned as-is (`Null` when
    /// empty). Any non-2xx answer is an `Error::Status`.
    pub async fn health(&self) -> Result<Value> {
        self.transport.get(HEALTH_PATH, &[]).await
    }
}
