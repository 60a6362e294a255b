//! Shared foundation for the lab workspace: the error classification every
//! adapter maps into, an explicitly owned expiring cache for controller
//! sessions, environment lookups and input validation helpers.

pub mod cache;
pub mod env;
pub mod error;
pub mod validation;

pub use cache::TimedCache;
pub use env::ConfigError;
pub use error::{ErrorClass, ValidationError};
