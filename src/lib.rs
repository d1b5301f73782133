//! # encfs-volume — an EncFS 6 compatible encrypting volume engine
//!
//! Format guarantees (frozen, bit-exact with the EncFS 6 "ssl/aes 3.0" /
//! "nameio/block 3.0" combination):
//! - Every filename and file body is independently encrypted; neither names
//!   nor contents nor directory structure are recoverable without the
//!   passphrase.
//! - The `mac64` fold consumes exactly the first 19 of HMAC-SHA1's 20 output
//!   bytes, and the AES-CFB stream codec's shuffle/flip/shuffle pipeline runs
//!   in the exact order documented on [`block`] — both are compatibility
//!   constants, not design choices, and must never be "fixed".
//! - The volume descriptor (`.encfs6.xml`) is the single source of truth for
//!   a volume's shape; once loaded it is never mutated.
//! - This crate is the volume engine only: no kernel/FUSE/Dokan shim, no
//!   mount-point lifecycle, no platform keystore. [`Volume`] exposes a small
//!   typed interface for a filesystem shim (or this crate's own CLI) to
//!   drive directly against a directory-backed encrypted tree.

pub mod primitives;
pub mod iv;
pub mod mac;
pub mod error;
pub mod config;
pub mod name;
pub mod block;
pub mod storage;
pub mod handle;
pub mod volume;

pub use block::{to_decoded, to_encoded, BlockParams};
pub use config::{CreateMode, UnlockedVolume, VolumeConfig};
pub use error::{Result, VolumeError};
pub use handle::registry::HandleRegistry;
pub use handle::FileHandle;
pub use storage::{FsBackend, MemBackend, StorageBackend};
pub use volume::{Volume, CONFIG_FILE_NAME};
