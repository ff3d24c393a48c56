//! # xenvars-core
//!
//! The heart of the variable service: the little-endian codec, the in-memory
//! variable store with snapshot round-trip, the authenticated-variable
//! engine (PKCS#7 over a hand-rolled DER cursor), and the XenVariable
//! protocol dispatcher.
//!
//! Nothing in this crate touches the host. The daemon maps guest memory and
//! hands `handle()` a byte window; the backends persist whatever
//! `VarStore::snapshot` produces.

#![deny(unsafe_code)]

pub mod auth;
pub mod codec;
pub mod protocol;
pub mod store;

pub use protocol::Service;
pub use store::{Variable, VarStore};

use xenvars_efi::EfiStatus;

/// Process-wide policy knobs, derived from the host exactly once at
/// bootstrap and threaded by reference from there on.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Secure boot was requested for the guest.
    pub secure_boot_enabled: bool,
    /// `true` rejects failed authenticated writes; `false` logs and accepts
    /// them for non-policy variables.
    pub enforcing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            secure_boot_enabled: true,
            enforcing: true,
        }
    }
}

/// Internal failure kinds, mapped onto `EFI_STATUS` at the wire boundary.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceError {
    /// Malformed request, illegal attributes, unparseable payload.
    InvalidParameter,
    /// Caller's buffer is too small; carries the required size.
    BufferTooSmall(u64),
    /// No such variable.
    NotFound,
    /// Store full or a per-variable limit exceeded.
    OutOfResources,
    /// Authentication failed: bad signature, unknown signer, replay.
    SecurityViolation,
    /// Attribute mismatch on update, or delete of a protected variable.
    WriteProtected,
    /// Unknown protocol version or command.
    Unsupported,
}

impl ServiceError {
    pub fn status(self) -> EfiStatus {
        match self {
            ServiceError::InvalidParameter => EfiStatus::INVALID_PARAMETER,
            ServiceError::BufferTooSmall(_) => EfiStatus::BUFFER_TOO_SMALL,
            ServiceError::NotFound => EfiStatus::NOT_FOUND,
            ServiceError::OutOfResources => EfiStatus::OUT_OF_RESOURCES,
            ServiceError::SecurityViolation => EfiStatus::SECURITY_VIOLATION,
            ServiceError::WriteProtected => EfiStatus::WRITE_PROTECTED,
            ServiceError::Unsupported => EfiStatus::UNSUPPORTED,
        }
    }
}
