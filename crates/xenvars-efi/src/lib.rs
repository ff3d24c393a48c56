//! # xenvars-efi
//!
//! UEFI data model shared by the xenvars variable service: GUIDs, status
//! codes, variable attributes, `EFI_TIME`, UTF-16 variable names and
//! signature lists.
//!
//! Everything in this crate is plain data with strict, bounds-checked
//! decoding. No I/O, no policy.

#![deny(unsafe_code)]

pub mod attrs;
pub mod guid;
pub mod name;
pub mod signature;
pub mod status;
pub mod time;

pub use attrs::VarAttrs;
pub use guid::Guid;
pub use name::VarName;
pub use signature::{SignatureEntry, SignatureList, SigListError};
pub use status::EfiStatus;
pub use time::EfiTime;

/// Maximum number of variables the service will hold.
pub const MAX_VAR_COUNT: usize = 128;

/// Maximum variable name size in bytes of UTF-16LE, terminator included.
pub const MAX_VARIABLE_NAME_SIZE: usize = 256;

/// Maximum variable data size in bytes.
pub const MAX_VARIABLE_DATA_SIZE: usize = 32 * 1024;

/// Guest pages shared for one request/response exchange.
pub const SHMEM_PAGES: usize = 16;

/// Guest page size.
pub const PAGE_SIZE: usize = 4096;

/// Size of the shared request/response window in bytes.
pub const SHMEM_SIZE: usize = SHMEM_PAGES * PAGE_SIZE;

/// Port-I/O base the guest firmware writes the frame number to.
pub const IO_PORT_ADDR: u64 = 0x100;

/// Width of the port-I/O surface in bytes.
pub const IO_PORT_SIZE: u64 = 4;
