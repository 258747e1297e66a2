//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use veilstore_core::crypto::VaultKey;
use veilstore_core::engine::{Engine, EngineConfig, StoreOptions};
use veilstore_core::keystore::StaticKeyStore;

pub const FOOTER_KEY: [u8; 16] = [0x5C; 16];

/// An engine rooted in its own temp directory. Dropping it removes the
/// directory, containers included.
pub struct TestVault {
    pub dir: TempDir,
    pub engine: Arc<Engine>,
}

/// Route engine tracing through `RUST_LOG` when a test run wants it.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestVault {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("create temp dir");
        let engine = Engine::new(EngineConfig {
            root: dir.path().to_path_buf(),
            keystore: Arc::new(StaticKeyStore(FOOTER_KEY)),
            max_expansion_blobs: None,
        })
        .expect("create engine");
        Self {
            dir,
            engine: Arc::new(engine),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.path().join(veilstore_core::pool::PRIMARY_FILE_NAME)
    }
}

pub fn key(byte: u8) -> VaultKey {
    VaultKey::from_bytes([byte; 32])
}

/// Deterministic incrementing byte pattern.
pub fn incrementing(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

pub fn opts() -> StoreOptions {
    StoreOptions::default()
}

/// Write `data` to a file under `dir` and return its path.
pub fn write_source_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).expect("write source file");
    path
}
