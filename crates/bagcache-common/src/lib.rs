//! bagcache Common - Shared types and utilities
//!
//! This crate provides the error taxonomy and configuration types used by
//! the bag cache and the tools built on top of it.

pub mod config;
pub mod error;

pub use config::{CacheConfig, MetadataCacheConfig, RecordCacheConfig};
pub use error::{Error, Result};
