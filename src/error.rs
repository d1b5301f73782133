//! Error taxonomy for the volume engine.
//!
//! One `thiserror` enum per concern, funnelling into [`VolumeError`] at the
//! component boundary.

use std::io;
use thiserror::Error;

/// Errors raised by the primitive layer before they reach a component
/// boundary. Kept separate from [`VolumeError`] so that the primitive layer
/// has no dependency on the higher-level taxonomy.
#[derive(Error, Debug)]
pub enum PrimitiveError {
    #[error("key length {0} is not a supported AES key size (16/24/32 bytes)")]
    BadKeyLength(usize),
    #[error("base64 input contains a character outside the name-codec alphabet")]
    InvalidBase64Char,
}

/// Top-level error type returned at every public API boundary.
#[derive(Error, Debug)]
pub enum VolumeError {
    /// The volume descriptor is missing a required field, carries an
    /// unparseable integer, or names an unsupported algorithm.
    #[error("bad volume configuration: {0}")]
    BadConfiguration(String),

    /// Volume-key MAC mismatch or salt-decode failure. Intentionally
    /// indistinguishable from "wrong passphrase".
    #[error("unlock failed")]
    UnlockFailed,

    /// MAC mismatch on a block or name, invalid PKCS#7 padding, or bad
    /// base64 in a name. Never silently recovered.
    #[error("invalid block or name: {0}")]
    InvalidBlock(String),

    /// Misuse — an operation against a closed handle, a write against a
    /// reverse-mode (read-only) volume, and similar caller errors.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Storage-backend read failure, after any backend-level retries.
    #[error("read error: {0}")]
    ReadError(#[source] io::Error),

    /// Storage-backend write failure, after the three-attempt retry policy.
    #[error("write error: {0}")]
    WriteError(#[source] io::Error),
}

impl From<PrimitiveError> for VolumeError {
    fn from(e: PrimitiveError) -> Self {
        VolumeError::InvalidBlock(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VolumeError>;
