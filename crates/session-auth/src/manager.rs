//! Token lifecycle: expiry evaluation, proactive refresh, refresh RPC
//!
//! Token state is derived on every call from the store and the access
//! token's claims; nothing about validity is cached:
//!
//! - `NoToken`: no access token in the store
//! - `Valid`: decodes and `exp` is strictly in the future
//! - `Expired`: `exp` has passed, is missing, or the token doesn't decode
//!
//! The manager is the only writer of the token keys. `set_tokens` is the only
//! path that arms the refresh timer; `clear_tokens` disarms it. Concurrent
//! refresh requests share one in-flight RPC.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::claims;
use crate::clock::{Clock, SystemClock};
use crate::constants::{ACCESS_TOKEN_KEY, MAX_REFRESH_DELAY, REFRESH_LEAD, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};
use crate::store::CredentialStore;
use crate::timer::TimerSlot;
use crate::token::{AuthApi, TokenPair};

/// Derived validity of the stored access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    Valid,
    Expired,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenPair>>>;

struct Inner {
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn AuthApi>,
    clock: Arc<dyn Clock>,
    refresh_timer: TimerSlot,
    in_flight: Mutex<Option<SharedRefresh>>,
    /// Bumped by `clear_tokens` so a refresh that started before a logout
    /// cannot write tokens back afterwards.
    session_epoch: AtomicU64,
    state_tx: watch::Sender<TokenState>,
}

/// Owns the access/refresh token pair and keeps it fresh.
///
/// Cheap to clone; clones share the same store, timer and in-flight refresh.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Create a manager on the system clock.
    ///
    /// If the store already holds a valid access token, the proactive refresh
    /// is scheduled straight away (requires a tokio runtime to arm).
    pub fn new(store: Arc<dyn CredentialStore>, api: Arc<dyn AuthApi>) -> Self {
        Self::with_clock(store, api, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TokenState::NoToken);
        let manager = Self {
            inner: Arc::new(Inner {
                store,
                api,
                clock,
                refresh_timer: TimerSlot::new("token-refresh"),
                in_flight: Mutex::new(None),
                session_epoch: AtomicU64::new(0),
                state_tx,
            }),
        };
        manager.inner.state_tx.send_replace(manager.state());
        manager.resume();
        manager
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.inner.store.get(ACCESS_TOKEN_KEY)
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.inner.store.get(REFRESH_TOKEN_KEY)
    }

    pub fn state(&self) -> TokenState {
        match self.get_access_token() {
            None => TokenState::NoToken,
            Some(token) => match claims::decode(&token) {
                Ok(claims) if claims.is_live_at(self.inner.clock.unix_secs()) => {
                    TokenState::Valid
                }
                Ok(_) => TokenState::Expired,
                Err(e) => {
                    debug!(error = %e, "access token does not decode, treating as expired");
                    TokenState::Expired
                }
            },
        }
    }

    /// True iff an access token exists, decodes, and `exp` is strictly
    /// greater than now. No leeway is applied.
    pub fn has_valid_access_token(&self) -> bool {
        self.state() == TokenState::Valid
    }

    /// Receiver notified whenever the stored tokens are written or cleared.
    pub fn subscribe(&self) -> watch::Receiver<TokenState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a proactive refresh is currently scheduled.
    pub fn refresh_scheduled(&self) -> bool {
        self.inner.refresh_timer.is_armed()
    }

    /// Store a new pair, then re-arm the proactive refresh for it.
    pub fn set_tokens(&self, access_token: &str, refresh_token: &str) {
        self.inner.store.set(ACCESS_TOKEN_KEY, access_token);
        self.inner.store.set(REFRESH_TOKEN_KEY, refresh_token);
        self.schedule_refresh();
        self.notify();
    }

    /// Remove both tokens and cancel any scheduled refresh.
    pub fn clear_tokens(&self) {
        self.inner.session_epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.store.remove(ACCESS_TOKEN_KEY);
        self.inner.store.remove(REFRESH_TOKEN_KEY);
        self.inner.refresh_timer.cancel();
        self.notify();
        info!("tokens cleared");
    }

    /// Re-arm the proactive refresh if the stored access token is valid.
    pub fn resume(&self) {
        if self.has_valid_access_token() {
            self.schedule_refresh();
        }
    }

    /// Exchange the stored refresh token for a new pair.
    ///
    /// Callers that arrive while a refresh is already running wait for that
    /// one and receive its outcome; only one RPC is in flight at a time.
    /// On failure the stored tokens are left untouched: whether to force a
    /// logout is the caller's decision.
    pub async fn refresh_token(&self) -> Result<TokenPair> {
        let refresh = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let pending = self.clone().run_refresh().boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        refresh.await
    }

    async fn run_refresh(self) -> Result<TokenPair> {
        let Some(refresh_token) = self.get_refresh_token() else {
            self.inner.in_flight.lock().take();
            warn!("token refresh requested without a refresh token");
            metrics::counter!("auth_token_refresh_total", "outcome" => "no_refresh_token")
                .increment(1);
            return Err(Error::NoRefreshToken);
        };

        let epoch = self.inner.session_epoch.load(Ordering::Acquire);
        let outcome = self.inner.api.refresh(&refresh_token).await;
        self.settle_refresh(outcome, epoch)
    }

    /// Apply a finished refresh RPC.
    ///
    /// The in-flight slot is emptied under its lock before the new pair is
    /// stored, and the lock is held until the follow-up refresh is armed. A
    /// refresh triggered by that follow-up therefore always starts its own
    /// RPC instead of joining this completed one.
    fn settle_refresh(&self, outcome: Result<TokenPair>, epoch: u64) -> Result<TokenPair> {
        let mut slot = self.inner.in_flight.lock();
        slot.take();

        match outcome {
            Ok(pair) => {
                if self.inner.session_epoch.load(Ordering::Acquire) != epoch {
                    info!("tokens cleared while refresh was in flight, discarding new pair");
                    metrics::counter!("auth_token_refresh_total", "outcome" => "discarded")
                        .increment(1);
                    return Err(Error::RefreshFailed(
                        "session was cleared during refresh".into(),
                    ));
                }
                self.set_tokens(&pair.access_token, &pair.refresh_token);
                drop(slot);
                metrics::counter!("auth_token_refresh_total", "outcome" => "success")
                    .increment(1);
                info!("access token refreshed");
                Ok(pair)
            }
            Err(e) => {
                drop(slot);
                error!(error = %e, "token refresh failed");
                metrics::counter!("auth_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                Err(e)
            }
        }
    }

    /// Arm the single refresh timer for the stored access token.
    ///
    /// Decode failures are logged and abandon the attempt; the next
    /// `set_tokens` re-arms.
    fn schedule_refresh(&self) {
        self.inner.refresh_timer.cancel();

        let Some(access_token) = self.get_access_token() else {
            return;
        };
        let exp = match claims::decode(&access_token) {
            Ok(claims) => match claims.exp {
                Some(exp) => exp,
                None => {
                    warn!("access token has no exp claim, refresh not scheduled");
                    return;
                }
            },
            Err(e) => {
                warn!(error = %e, "cannot decode access token, refresh not scheduled");
                return;
            }
        };

        let delay = refresh_delay(exp, self.inner.clock.now());
        let weak = Arc::downgrade(&self.inner);
        let armed = self.inner.refresh_timer.arm(delay, async move {
            // The manager may have been dropped while the timer was pending.
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = TokenManager { inner };
            if let Err(e) = manager.refresh_token().await {
                warn!(error = %e, "scheduled token refresh failed");
            }
        });
        if armed {
            info!(in_secs = delay.as_secs(), "proactive token refresh scheduled");
        }
    }

    fn notify(&self) {
        self.inner.state_tx.send_replace(self.state());
    }
}

/// Delay until the proactive refresh: `REFRESH_LEAD` before `exp`, never
/// negative and never beyond `MAX_REFRESH_DELAY`.
pub fn refresh_delay(exp: f64, now: SystemTime) -> Duration {
    let now_secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let remaining = exp - now_secs - REFRESH_LEAD.as_secs_f64();
    if remaining.is_nan() || remaining <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(remaining)
        .map_or(MAX_REFRESH_DELAY, |delay| delay.min(MAX_REFRESH_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{ManualClock, token_expiring_at, unsigned_token};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const NOW: u64 = 1_700_000_000;

    /// Fake refresh endpoint: records every refresh token it receives and
    /// answers with a fresh pair expiring an hour after `NOW`, or an error.
    struct FakeApi {
        calls: AtomicUsize,
        seen: mpsc::UnboundedSender<String>,
        fail_with: Option<Error>,
        delay: Duration,
        /// The first `short_lived` pairs expire inside the refresh lead.
        short_lived: usize,
    }

    impl FakeApi {
        fn new(seen: mpsc::UnboundedSender<String>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen,
                fail_with: None,
                delay: Duration::ZERO,
                short_lived: 0,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AuthApi for FakeApi {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = self.seen.send(refresh_token.to_string());
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let exp = if n <= self.short_lived { NOW + 30 } else { NOW + 3600 };
                match &self.fail_with {
                    Some(e) => Err(e.clone()),
                    None => Ok(TokenPair::new(token_expiring_at(exp), format!("rt_{n}"))),
                }
            })
        }
    }

    fn manager_with(api: Arc<FakeApi>) -> (TokenManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(NOW));
        let manager = TokenManager::with_clock(Arc::new(MemoryStore::new()), api, clock.clone());
        (manager, clock)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn state_is_no_token_when_store_is_empty() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));
        assert_eq!(manager.state(), TokenState::NoToken);
        assert!(!manager.has_valid_access_token());
    }

    #[tokio::test]
    async fn future_exp_is_valid_and_past_exp_is_not() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));

        for exp in [NOW + 1, NOW + 60, NOW + 86_400] {
            manager.set_tokens(&token_expiring_at(exp), "rt");
            assert!(manager.has_valid_access_token(), "exp {exp} must be valid");
        }
        for exp in [NOW, NOW - 1, 0] {
            manager.set_tokens(&token_expiring_at(exp), "rt");
            assert!(!manager.has_valid_access_token(), "exp {exp} must be expired");
            assert_eq!(manager.state(), TokenState::Expired);
        }
    }

    #[tokio::test]
    async fn undecodable_or_exp_less_token_is_expired() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));

        manager.set_tokens("not-a-jwt", "rt");
        assert_eq!(manager.state(), TokenState::Expired);
        assert!(!manager.refresh_scheduled());

        manager.set_tokens(&unsigned_token(&serde_json::json!({"sub": "x"})), "rt");
        assert_eq!(manager.state(), TokenState::Expired);
        assert!(!manager.refresh_scheduled());
    }

    #[tokio::test]
    async fn expiry_follows_the_clock() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, clock) = manager_with(Arc::new(FakeApi::new(tx)));

        manager.set_tokens(&token_expiring_at(NOW + 10), "rt");
        assert!(manager.has_valid_access_token());
        clock.advance(Duration::from_secs(10));
        assert!(!manager.has_valid_access_token());
    }

    #[tokio::test]
    async fn set_tokens_round_trips_exactly() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));
        let access = token_expiring_at(NOW + 3600);

        manager.set_tokens(&access, "rt_exact");
        assert_eq!(manager.get_access_token().as_deref(), Some(access.as_str()));
        assert_eq!(manager.get_refresh_token().as_deref(), Some("rt_exact"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_fires_sixty_seconds_before_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::new(tx));
        let (manager, _) = manager_with(api.clone());

        manager.set_tokens(&token_expiring_at(NOW + 3600), "R1");
        assert!(manager.refresh_scheduled());

        tokio::time::advance(Duration::from_secs(3539)).await;
        settle().await;
        assert_eq!(api.calls(), 0, "refresh must not fire before exp - 60s");

        tokio::time::advance(Duration::from_secs(2)).await;
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent, "R1");
        settle().await;
        assert_eq!(manager.get_refresh_token().as_deref(), Some("rt_1"));
        // The refreshed pair re-armed the timer for itself.
        assert!(manager.refresh_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn near_expiry_token_refreshes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));

        manager.set_tokens(&token_expiring_at(NOW + 30), "R_soon");
        assert_eq!(rx.recv().await.unwrap(), "R_soon");
    }

    #[tokio::test(start_paused = true)]
    async fn set_tokens_rearms_instead_of_stacking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::new(tx));
        let (manager, _) = manager_with(api.clone());

        manager.set_tokens(&token_expiring_at(NOW + 600), "R_first");
        manager.set_tokens(&token_expiring_at(NOW + 3600), "R_second");

        tokio::time::advance(Duration::from_secs(3541)).await;
        assert_eq!(rx.recv().await.unwrap(), "R_second");
        settle().await;
        assert_eq!(api.calls(), 1, "the replaced timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_tokens_disarms_refresh() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::new(tx));
        let (manager, _) = manager_with(api.clone());

        manager.set_tokens(&token_expiring_at(NOW + 3600), "R1");
        manager.clear_tokens();

        assert!(!manager.has_valid_access_token());
        assert!(manager.get_access_token().is_none());
        assert!(manager.get_refresh_token().is_none());
        assert!(!manager.refresh_scheduled());

        tokio::time::advance(Duration::from_secs(7200)).await;
        settle().await;
        assert_eq!(api.calls(), 0, "no refresh RPC may fire after clear_tokens");
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::new(tx));
        let (manager, _) = manager_with(api.clone());

        let err = manager.refresh_token().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_stores_and_returns_new_pair() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));
        manager.set_tokens("expired-garbage", "R1");

        let pair = manager.refresh_token().await.unwrap();
        assert_eq!(pair.refresh_token, "rt_1");
        assert_eq!(manager.get_access_token(), Some(pair.access_token));
        assert!(manager.has_valid_access_token());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stored_tokens() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut api = FakeApi::new(tx);
        api.fail_with = Some(Error::InvalidCredentials("revoked".into()));
        let (manager, _) = manager_with(Arc::new(api));
        manager.set_tokens("at_old", "rt_old");

        let err = manager.refresh_token().await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)));
        assert_eq!(manager.get_access_token().as_deref(), Some("at_old"));
        assert_eq!(manager.get_refresh_token().as_deref(), Some("rt_old"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_rpc() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut api = FakeApi::new(tx);
        api.delay = Duration::from_millis(50);
        let api = Arc::new(api);
        let (manager, _) = manager_with(api.clone());
        manager.set_tokens("at_old", "rt_old");

        let (a, b, c) = tokio::join!(
            manager.refresh_token(),
            manager.refresh_token(),
            manager.refresh_token()
        );
        assert_eq!(api.calls(), 1);
        assert_eq!(a.unwrap(), b.clone().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());

        // Once settled, the next refresh is a new RPC.
        manager.refresh_token().await.unwrap();
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_completing_after_clear_is_discarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut api = FakeApi::new(tx);
        api.delay = Duration::from_secs(1);
        let (manager, _) = manager_with(Arc::new(api));
        manager.set_tokens("at_old", "rt_old");

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_token().await }
        });
        assert_eq!(rx.recv().await.unwrap(), "rt_old");
        manager.clear_tokens();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(manager.state(), TokenState::NoToken);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_due_right_after_a_refresh_still_runs() {
        for _ in 0..200 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut api = FakeApi::new(tx);
            api.short_lived = 1;
            let (manager, _) = manager_with(Arc::new(api));
            manager.set_tokens("at_old", "rt_old");

            let pair = manager.refresh_token().await.unwrap();
            assert_eq!(pair.refresh_token, "rt_1");
            assert_eq!(rx.recv().await.as_deref(), Some("rt_old"));

            // rt_1's access token is inside the lead, so its timer fires at
            // once and must start a second RPC of its own.
            let follow_up = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("follow-up refresh never reached the API");
            assert_eq!(follow_up.as_deref(), Some("rt_1"));
            manager.clear_tokens();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn far_future_exp_schedules_capped_refresh() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::new(tx));
        let (manager, _) = manager_with(api.clone());

        for exp in [1e19, 1e20, f64::MAX] {
            manager.set_tokens(&unsigned_token(&serde_json::json!({ "exp": exp })), "rt");
            assert_eq!(manager.state(), TokenState::Valid, "exp {exp}");
            assert!(manager.refresh_scheduled(), "exp {exp}");
        }

        tokio::time::advance(MAX_REFRESH_DELAY - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_writes_and_clears() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (manager, _) = manager_with(Arc::new(FakeApi::new(tx)));
        let mut changes = manager.subscribe();
        assert_eq!(*changes.borrow(), TokenState::NoToken);

        manager.set_tokens(&token_expiring_at(NOW + 3600), "rt");
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), TokenState::Valid);

        manager.clear_tokens();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), TokenState::NoToken);
    }

    #[tokio::test(start_paused = true)]
    async fn new_manager_resumes_schedule_for_stored_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryStore::new());
        store.set(ACCESS_TOKEN_KEY, &token_expiring_at(NOW + 120));
        store.set(REFRESH_TOKEN_KEY, "R_stored");

        let manager = TokenManager::with_clock(
            store,
            Arc::new(FakeApi::new(tx)),
            Arc::new(ManualClock::at_unix(NOW)),
        );
        assert!(manager.refresh_scheduled());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await.unwrap(), "R_stored");
    }

    #[test]
    fn refresh_delay_is_floored_at_zero() {
        let now = UNIX_EPOCH + Duration::from_secs(NOW);
        assert_eq!(
            refresh_delay((NOW + 3600) as f64, now),
            Duration::from_secs(3540)
        );
        assert_eq!(refresh_delay((NOW + 60) as f64, now), Duration::ZERO);
        assert_eq!(refresh_delay((NOW - 500) as f64, now), Duration::ZERO);
        assert_eq!(refresh_delay(f64::NAN, now), Duration::ZERO);
        assert_eq!(refresh_delay(f64::NEG_INFINITY, now), Duration::ZERO);
    }

    #[test]
    fn refresh_delay_is_capped() {
        let now = UNIX_EPOCH + Duration::from_secs(NOW);
        for exp in [1e19, 1e20, f64::MAX, f64::INFINITY] {
            assert_eq!(refresh_delay(exp, now), MAX_REFRESH_DELAY, "exp {exp}");
        }
        let in_two_days = (NOW + 2 * 86_400) as f64;
        assert_eq!(
            refresh_delay(in_two_days, now),
            Duration::from_secs(2 * 86_400 - 60)
        );
    }
}
