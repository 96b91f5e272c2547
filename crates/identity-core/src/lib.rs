//! # identity-core
//!
//! Core types and utilities for directory-backed identity providers.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy separating transient from authoritative failures
//! - [`config`] - Flat key/value configuration maps with `user.`/`group.` routing
//! - [`credentials`] - Service and login credentials
//! - [`cache`] - Generic cache stores and cache statistics

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheCounters, CacheStats, CacheStore, InMemoryCacheStore};
pub use config::{ConfigMap, ConfigSections};
pub use credentials::ServiceCredentials;
pub use error::{Error, Result};
