//! Client-side session credential management
//!
//! Keeps a short-lived access token and a longer-lived refresh token valid
//! without user-visible interruption. The crate is a standalone library with
//! no dependency on the HTTP transport or the streaming consumer built on
//! top of it.
//!
//! Credential flow:
//! 1. Caller logs in and hands the pair to `TokenManager::set_tokens()`
//! 2. Pair is written to the `CredentialStore` (sole writer: the manager)
//! 3. The access token's `exp` claim is decoded by `claims::decode()`
//! 4. A single-slot timer fires 60 seconds before expiry
//! 5. `TokenManager::refresh_token()` calls `/auth/refresh` via `AuthApi`
//! 6. The new pair goes back through `set_tokens()`, re-arming the timer

pub mod claims;
pub mod clock;
pub mod constants;
pub mod error;
pub mod idle;
pub mod manager;
pub mod store;
pub mod timer;
pub mod token;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use claims::{Claims, decode};
pub use clock::{Clock, SystemClock};
pub use constants::*;
pub use error::{Error, Result};
pub use idle::IdleTimeout;
pub use manager::{TokenManager, TokenState};
pub use store::{CredentialStore, FileStore, MemoryStore};
pub use timer::TimerSlot;
pub use token::{AuthApi, HttpAuthApi, TokenPair};
