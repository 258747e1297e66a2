//! Encrypted vault storage engine.
//!
//! VeilStore keeps user files as opaque ciphertext inside pre-allocated,
//! random-filled container files ("blobs"). A per-vault encrypted index maps
//! stable file ids to byte ranges inside the pool; the index also carries the
//! wrapped master key, so changing the vault key never touches file content.
//! Two resumable transfer pipelines sit on top: phrase-addressed sharing and
//! private cloud backup, both against an abstract [`store::ObjectStore`].
//!
//! The host constructs one [`engine::Engine`] per process and passes an
//! opaque 32-byte [`crypto::VaultKey`] into each operation. Unencrypted
//! content never crosses the engine boundary except through the explicit
//! retrieve operations.

pub mod crypto;
pub mod engine;
pub mod error;
pub mod index;
pub mod keystore;
pub mod pool;
pub mod store;
pub mod transfer;

mod clock;

pub use crypto::{MasterKey, ShareKey, VaultKey};
pub use engine::{Engine, EngineConfig};
pub use error::StorageError;
pub use keystore::SecureKeyStore;
pub use store::ObjectStore;
