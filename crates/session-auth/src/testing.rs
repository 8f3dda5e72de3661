//! Test fixtures: unsigned tokens and a manually driven clock

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;

use crate::clock::Clock;

/// Build a `header.payload.signature` token around the given claims.
/// The signature segment is a placeholder; nothing here verifies it.
pub fn unsigned_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

/// Token whose `exp` is the given unix timestamp in seconds.
pub fn token_expiring_at(exp: u64) -> String {
    unsigned_token(&serde_json::json!({ "exp": exp, "sub": "test-user" }))
}

/// Seconds since the epoch for the system clock, for tests that mint tokens
/// relative to real time.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Clock frozen at `secs` seconds after the epoch.
    pub fn at_unix(secs: u64) -> Self {
        Self {
            now: Mutex::new(UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
