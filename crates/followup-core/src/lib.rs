//! # followup-core
//!
//! Shared types, errors, configuration and collaborator traits for the
//! follow-up scheduler.

pub mod config;
pub mod error;
pub mod template;
pub mod traits;
pub mod types;

pub use config::FollowUpConfig;
pub use error::{FollowUpError, Result};
