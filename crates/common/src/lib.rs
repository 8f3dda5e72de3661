//! Types shared by the session, transport and streaming crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
