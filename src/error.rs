//! Error taxonomy for the storage engine's public boundary.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds a caller of the engine can observe.
#[derive(Debug, Error)]
pub enum Error {
    /// A key failed validation for its intended operation (size, structure).
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    /// The volume specification parser rejected the spec string.
    #[error("invalid volume specification: {0}")]
    InvalidVolumeSpec(String),

    /// Allocation would exceed the volume's configured maximum page count.
    #[error("volume full")]
    VolumeFull,

    /// A page header/signature/invariant check failed while reading a volume.
    #[error("corrupt volume: {0}")]
    CorruptVolume(String),

    /// A journal record was missing, malformed, or violated the WAL invariant.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// A lock or I/O wait exceeded its configured deadline.
    #[error("timeout waiting on {0}")]
    Timeout(&'static str),

    /// A join would require rearranging more than the two flanking pages.
    #[error("rebalance required")]
    Rebalance,

    /// The calling transaction was rolled back; the caller must retry or abort.
    #[error("transaction rolled back")]
    Rollback,

    /// The operation was cancelled and may be retried.
    #[error("interrupted")]
    Interrupted,

    /// The engine has hit an unrecoverable inconsistency and is unusable until restart.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors a caller may reasonably retry (timeout, interrupted, rollback).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Interrupted | Error::Rollback)
    }

    /// True once this error has put the engine into the fatal state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Acquires a `std::sync::Mutex`, converting lock poisoning into a `Fatal` error
/// rather than panicking at the call site.
pub fn fatal_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("internal mutex poisoned; engine is no longer usable");
        Error::Fatal("poisoned lock".into())
    })
}
