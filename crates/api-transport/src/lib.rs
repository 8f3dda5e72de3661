//! Authenticated HTTP transport
//!
//! Wraps outbound API calls so that every request carries the current access
//! token, and a 401 is answered with exactly one refresh-and-retry. Also
//! hosts the session endpoints (login, register, current user) that sit on
//! top of the transport.
//!
//! Failures are handed to an injected `ErrorReporter` before they are
//! returned; this crate never reports errors process-wide on its own.

pub mod error;
pub mod reporter;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use reporter::{ErrorReporter, TracingReporter};
pub use session::{AuthResponse, AuthService, User};
pub use transport::{ApiRequest, AuthenticatedTransport};
