//! `EFI_STATUS` codes as they cross the XenVariable wire.
//!
//! UEFI allows implementation-specific codes, so this is a newtype over
//! `u64` rather than an enum. Only the codes this service actually returns
//! are given names.

use core::fmt;

/// A UEFI status code, serialized as a little-endian `u64`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct EfiStatus(u64);

/// Bit marking a status code as an error.
const ERROR_BIT: u64 = 1 << 63;

impl EfiStatus {
    /// The operation completed successfully.
    pub const SUCCESS: EfiStatus = EfiStatus(0);

    /// A parameter was incorrect.
    pub const INVALID_PARAMETER: EfiStatus = EfiStatus(2 | ERROR_BIT);

    /// The operation is not supported.
    pub const UNSUPPORTED: EfiStatus = EfiStatus(3 | ERROR_BIT);

    /// The buffer is not large enough; the required size is returned in the
    /// appropriate response field.
    pub const BUFFER_TOO_SMALL: EfiStatus = EfiStatus(5 | ERROR_BIT);

    /// The variable cannot be written to.
    pub const WRITE_PROTECTED: EfiStatus = EfiStatus(8 | ERROR_BIT);

    /// A resource has run out.
    pub const OUT_OF_RESOURCES: EfiStatus = EfiStatus(9 | ERROR_BIT);

    /// The item was not found.
    pub const NOT_FOUND: EfiStatus = EfiStatus(14 | ERROR_BIT);

    /// The operation was denied by the security policy.
    pub const SECURITY_VIOLATION: EfiStatus = EfiStatus(26 | ERROR_BIT);

    /// Raw wire value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds a status from its wire value.
    pub fn from_u64(raw: u64) -> Self {
        EfiStatus(raw)
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn is_error(self) -> bool {
        self.0 & ERROR_BIT != 0
    }
}

impl fmt::Display for EfiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "EFI_SUCCESS",
            Self::INVALID_PARAMETER => "EFI_INVALID_PARAMETER",
            Self::UNSUPPORTED => "EFI_UNSUPPORTED",
            Self::BUFFER_TOO_SMALL => "EFI_BUFFER_TOO_SMALL",
            Self::WRITE_PROTECTED => "EFI_WRITE_PROTECTED",
            Self::OUT_OF_RESOURCES => "EFI_OUT_OF_RESOURCES",
            Self::NOT_FOUND => "EFI_NOT_FOUND",
            Self::SECURITY_VIOLATION => "EFI_SECURITY_VIOLATION",
            EfiStatus(other) => return write!(f, "EFI_STATUS({other:#x})"),
        };
        f.write_str(name)
    }
}
