//! GUIDs in the UEFI flavor of RFC 4122: the first three fields are stored
//! little-endian, the trailing eight bytes as-is.

use core::fmt;

/// A 128-bit globally unique identifier.
///
/// The `Display` form is the canonical `8-4-4-4-12` registry format.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Guid {
    /// The low field of the timestamp.
    a: u32,
    /// The middle field of the timestamp.
    b: u16,
    /// The high field of the timestamp multiplexed with the version number.
    c: u16,
    /// Clock sequence and node identifier, stored verbatim.
    d: [u8; 8],
}

/// Length of the wire encoding in bytes.
pub const GUID_SIZE: usize = 16;

impl Guid {
    /// Creates a GUID from its four textual fields.
    pub const fn new(a: u32, b: u16, c: u16, d: [u8; 8]) -> Self {
        Guid { a, b, c, d }
    }

    /// Encodes to the 16-byte UEFI wire layout.
    pub fn to_bytes(self) -> [u8; GUID_SIZE] {
        let mut out = [0u8; GUID_SIZE];
        out[0..4].copy_from_slice(&self.a.to_le_bytes());
        out[4..6].copy_from_slice(&self.b.to_le_bytes());
        out[6..8].copy_from_slice(&self.c.to_le_bytes());
        out[8..16].copy_from_slice(&self.d);
        out
    }

    /// Decodes from the 16-byte UEFI wire layout.
    pub fn from_bytes(raw: [u8; GUID_SIZE]) -> Self {
        Guid {
            a: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            b: u16::from_le_bytes([raw[4], raw[5]]),
            c: u16::from_le_bytes([raw[6], raw[7]]),
            d: [
                raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
            ],
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.a,
            self.b,
            self.c,
            self.d[0],
            self.d[1],
            self.d[2],
            self.d[3],
            self.d[4],
            self.d[5],
            self.d[6],
            self.d[7],
        )
    }
}

/// `EFI_GLOBAL_VARIABLE_GUID`: PK, KEK, BootOrder, Boot####, Timeout, Lang,
/// PlatformLang, ConIn, ConOut, ErrOut.
pub const EFI_GLOBAL_VARIABLE: Guid = Guid::new(
    0x8be4df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

/// `EFI_IMAGE_SECURITY_DATABASE_GUID`: db and dbx.
pub const EFI_IMAGE_SECURITY_DATABASE: Guid = Guid::new(
    0xd719b2cb,
    0x3d3a,
    0x4596,
    [0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f],
);

/// `EFI_CERT_TYPE_PKCS7_GUID`: the only certificate type accepted in
/// `EFI_VARIABLE_AUTHENTICATION_2` descriptors.
pub const EFI_CERT_TYPE_PKCS7: Guid = Guid::new(
    0x4aafd29d,
    0x68df,
    0x49ee,
    [0x8a, 0xa9, 0x34, 0x7d, 0x37, 0x56, 0x65, 0xa7],
);

/// `EFI_CERT_X509_GUID`: an X.509 DER certificate signature-list entry.
pub const EFI_CERT_X509: Guid = Guid::new(
    0xa5c059a1,
    0x94e4,
    0x4aa7,
    [0x87, 0xb5, 0xab, 0x15, 0x5c, 0x2b, 0xf0, 0x72],
);

/// `EFI_CERT_SHA256_GUID`: a SHA-256 digest signature-list entry.
pub const EFI_CERT_SHA256: Guid = Guid::new(
    0xc1c41626,
    0x504c,
    0x4092,
    [0xac, 0xa9, 0x41, 0xf9, 0x36, 0x93, 0x43, 0x28],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_canonical() {
        assert_eq!(
            format!("{}", EFI_GLOBAL_VARIABLE),
            "8be4df61-93ca-11d2-aa0d-00e098032b8c"
        );
        assert_eq!(
            format!("{}", EFI_IMAGE_SECURITY_DATABASE),
            "d719b2cb-3d3a-4596-a3bc-dad00e67656f"
        );
    }

    #[test]
    fn wire_round_trip() {
        let raw = EFI_CERT_TYPE_PKCS7.to_bytes();
        // Mixed-endian layout: first three fields little-endian.
        assert_eq!(&raw[0..4], &[0x9d, 0xd2, 0xaf, 0x4a]);
        assert_eq!(&raw[4..6], &[0xdf, 0x68]);
        assert_eq!(&raw[6..8], &[0xee, 0x49]);
        assert_eq!(Guid::from_bytes(raw), EFI_CERT_TYPE_PKCS7);
    }
}
