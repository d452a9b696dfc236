//! Shared types for the farm session workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
