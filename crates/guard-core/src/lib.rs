//! Shared primitives for the file guard: errors, settings, digests, sealed
//! backups and the bounded event log.

pub mod backup_store;
pub mod crypto;
pub mod error;
pub mod event_log;
pub mod hasher;
pub mod paths;
pub mod settings;

pub use error::{GuardError, Result};
