//! Wiring: store → token manager → transport / stream consumer
//!
//! `App` owns one session. `ensure_session` reuses a still-valid stored
//! token or logs in; `stream_metrics` follows one metrics stream to its end,
//! logging out if no update arrives within the idle timeout.

use std::future::Future;
use std::sync::Arc;

use api_transport::{AuthService, AuthenticatedTransport, TracingReporter, User};
use event_stream::{EventStreamConsumer, StreamState, StreamUpdate};
use session_auth::{CredentialStore, HttpAuthApi, IdleTimeout, TokenManager, TokenState};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

pub struct App {
    config: Config,
    tokens: TokenManager,
    auth: AuthService,
    stream: EventStreamConsumer,
}

impl App {
    /// Build the client stack. Must be called from within a tokio runtime:
    /// a valid stored session has its refresh scheduled immediately.
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.api.timeout())
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;
        let base_url = config.api.base_url.trim_end_matches('/').to_string();

        let tokens = TokenManager::new(
            store,
            Arc::new(HttpAuthApi::new(client.clone(), base_url.clone())),
        );
        let transport = Arc::new(AuthenticatedTransport::new(
            client.clone(),
            base_url.clone(),
            tokens.clone(),
            Arc::new(TracingReporter),
        ));

        Ok(Self {
            auth: AuthService::new(transport),
            stream: EventStreamConsumer::new(client, base_url, tokens.clone()),
            tokens,
            config,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Log state transitions of the stored session until the manager goes away.
    pub fn watch_session(&self) {
        let mut changes = self.tokens.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                match state {
                    TokenState::Valid => info!("session active"),
                    TokenState::Expired => warn!("session access token expired"),
                    TokenState::NoToken => info!("session cleared"),
                }
            }
        });
    }

    /// Make sure a valid session exists, logging in (or registering) when
    /// the stored one is missing or expired.
    pub async fn ensure_session(&self, register: bool) -> Result<Option<User>> {
        if self.auth.is_logged_in() {
            info!("resuming stored session");
            return Ok(self.auth.current_user().await);
        }

        let email = &self.config.session.email;
        let password = self
            .config
            .session
            .password
            .as_ref()
            .ok_or(Error::MissingPassword)?;
        let response = if register {
            self.auth.register(email, password).await?
        } else {
            self.auth.login(email, password).await?
        };
        Ok(Some(response.user))
    }

    pub fn logout(&self) {
        self.auth.logout();
    }

    /// Ask the backend for its status. Only logged: later calls report
    /// their own failures.
    pub async fn check_health(&self) -> bool {
        match self.auth.health().await {
            Ok(status) => {
                info!(%status, "backend is healthy");
                true
            }
            Err(e) => {
                warn!(error = %e, "backend health check failed");
                false
            }
        }
    }

    /// Follow the metrics stream until it ends, `shutdown` resolves, or the
    /// session goes idle. Returns the folded stream state.
    pub async fn stream_metrics(&self, shutdown: impl Future<Output = ()>) -> Result<StreamState> {
        let mut session = self.stream.subscribe(self.config.stream.time_period);
        info!(session = %session.id(), time_period = self.config.stream.time_period, "subscribed to metrics");

        let idle_tokens = self.tokens.clone();
        let idle_cancel = session.cancel_token();
        let idle = IdleTimeout::new(self.config.session.idle_timeout(), move || {
            idle_tokens.clear_tokens();
            idle_cancel.cancel();
        });
        idle.start();

        let mut state = StreamState::default();
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let update = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, cancelling stream");
                    session.cancel();
                    break;
                }
                update = session.next() => update,
            };
            let Some(update) = update else { break };
            idle.touch();

            match &update {
                StreamUpdate::Progress(progress) => info!(%progress, "metrics progress"),
                StreamUpdate::Result { success, .. } => info!(success, "metrics result received"),
                StreamUpdate::Error(message) => warn!(%message, "metrics stream reported an error"),
                StreamUpdate::Failed(message) => {
                    idle.stop();
                    return Err(Error::Stream(message.clone()));
                }
                StreamUpdate::Closed => info!("metrics stream closed without a result"),
            }
            state.apply(&update);
        }

        if !idle.is_running() && state.loading {
            warn!(
                idle_secs = self.config.session.idle_timeout_secs,
                "no stream activity, logged out"
            );
        }
        idle.stop();
        Ok(state)
    }
}
