//! vaultcache: a transactional second-level object cache.
//!
//! The [`cache`] module is the library proper. [`config`], [`infra`] and
//! [`workload`] back the `vaultcache` binary.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod workload;
