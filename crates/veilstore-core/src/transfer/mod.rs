//! Resumable transfer pipelines.
//!
//! Two independent pipelines share the same retry and staging discipline
//! but no storage: [`share`] publishes a re-encrypted snapshot of a vault
//! under a one-time phrase, [`backup`] ships the whole on-disk state to the
//! user's private store. Both stage to disk before the first network write,
//! so an interrupted transfer resumes without re-running any cryptography.
//!
//! Each orchestrator owns at most one active task. Workers take every input
//! by value at spawn time and check a cooperative [`CancelFlag`] after each
//! chunk or file; observers watch status through a `tokio::sync::watch`
//! channel, never by polling shared state.

pub mod backup;
pub mod phrase;
pub mod share;
pub mod snapshot;
pub mod staging;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Remote transfers move payloads in chunks of at most this size. The
/// resume logic depends on it; the staged state records it explicitly.
pub const TRANSFER_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Share pipeline status, observed through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareStatus {
    Idle,
    Uploading { current: u64, total: u64 },
    Complete,
    Failed(String),
    Importing { current: u64, total: u64 },
    ImportComplete,
    ImportFailed(String),
}

/// Backup pipeline status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStatus {
    Idle,
    Staging,
    Uploading { current: u64, total: u64 },
    Complete,
    Failed(String),
    Restoring { current: u64, total: u64 },
    RestoreComplete,
    RestoreFailed(String),
}

/// Cooperative cancellation token.
///
/// Workers poll it between chunks and files; cancellation never interrupts
/// a write mid-record, so staged state stays consistent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
