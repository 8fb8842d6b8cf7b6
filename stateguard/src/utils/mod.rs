//! Utility modules shared by the orchestrators.

pub mod errors;
pub mod lock;
pub mod logger;

pub use errors::{Result, StateguardError};
