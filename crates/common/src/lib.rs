//! Common types for the Relay workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
