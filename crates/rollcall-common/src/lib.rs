//! # Rollcall Common
//!
//! Shared types, errors, and constants used across Rollcall components.
//!
//! ## Modules
//! - `types` - Core data model (resources, associations, change records, nodes)
//! - `error` - Common error type
//! - `constants` - Shared configuration defaults and sentinels

pub mod constants;
pub mod error;
pub mod types;

pub use error::{RollcallError, RollcallResult};
pub use types::*;
