//! Storage keys, endpoint paths and timing constants

use std::time::Duration;

/// Store key holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Store key holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// How long before `exp` the proactive refresh fires.
pub const REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Upper bound on a scheduled refresh delay. Tokens expiring later than
/// this are refreshed after a year instead.
pub const MAX_REFRESH_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const CURRENT_USER_PATH: &str = "/auth/me";
pub const HEALTH_PATH: &str = "/health";
