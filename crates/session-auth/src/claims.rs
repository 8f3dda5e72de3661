//! Access token claim decoding
//!
//! Reads the payload segment of a JWT-shaped token without verifying the
//! signature or issuer. The result only drives proactive refresh timing and
//! the local "is this token still usable" check; the server remains the
//! trust boundary.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Claims carried by an access token.
///
/// Only `exp` is interpreted. Everything else is kept opaque in `other`.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Expiry as seconds since the unix epoch. Fractional values are allowed
    /// by the JWT NumericDate format.
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Claims {
    /// Whether `exp` is present and strictly after `now_secs`.
    pub fn is_live_at(&self, now_secs: f64) -> bool {
        self.exp.is_some_and(|exp| exp > now_secs)
    }
}

/// Decode the claims of a `header.payload.signature` token.
pub fn decode(token: &str) -> Result<Claims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::MalformedToken(format!(
            "expected 3 segments, got {}",
            segments.len()
        )));
    }

    // Some issuers keep base64 padding on the payload segment.
    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::MalformedToken(format!("payload is not base64url: {e}")))?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::MalformedToken(format!("payload is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(Error::MalformedToken("payload is not a JSON object".into()));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::MalformedToken(format!("unexpected claim types: {e}")))
}
