//! Shared types for the oauth-gate workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
