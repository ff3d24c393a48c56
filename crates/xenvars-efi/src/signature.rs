//! `EFI_SIGNATURE_LIST` parsing.
//!
//! The stored form of PK, KEK, db and dbx is a sequence of signature lists:
//!
//! ```text
//! +----------------------+
//! | SignatureType (GUID) | 16 bytes
//! | SignatureListSize    | u32, covers the whole list
//! | SignatureHeaderSize  | u32
//! | SignatureSize        | u32, per entry, >= 16
//! +----------------------+
//! | header               | SignatureHeaderSize bytes
//! +----------------------+
//! | SignatureOwner (GUID)| \  repeated; each entry is
//! | SignatureData        | /  SignatureSize bytes total
//! +----------------------+
//! ```
//!
//! Everything here is bounds-checked; the input is guest-controlled.

use crate::guid::{self, Guid, GUID_SIZE};

/// One entry of a signature list: an owner GUID and the signature bytes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignatureEntry {
    pub owner: Guid,
    pub data: Vec<u8>,
}

/// One parsed `EFI_SIGNATURE_LIST`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignatureList {
    pub sig_type: Guid,
    pub entries: Vec<SignatureEntry>,
}

/// Signature-list decode failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SigListError {
    /// A field or entry crosses the end of the buffer.
    Truncated,
    /// Internal sizes are inconsistent (list smaller than its own header,
    /// entry size below the owner GUID, trailing partial entry).
    BadLength,
}

impl SignatureList {
    /// Parses a whole buffer as consecutive signature lists.
    ///
    /// An empty buffer yields an empty vector; trailing partial data is an
    /// error.
    pub fn parse_all(mut data: &[u8]) -> Result<Vec<SignatureList>, SigListError> {
        let mut lists = Vec::new();

        while !data.is_empty() {
            let (list, rest) = Self::parse_one(data)?;
            lists.push(list);
            data = rest;
        }

        Ok(lists)
    }

    fn parse_one(data: &[u8]) -> Result<(SignatureList, &[u8]), SigListError> {
        const FIXED: usize = GUID_SIZE + 4 + 4 + 4;

        if data.len() < FIXED {
            return Err(SigListError::Truncated);
        }

        let mut raw_guid = [0u8; GUID_SIZE];
        raw_guid.copy_from_slice(&data[..GUID_SIZE]);
        let sig_type = Guid::from_bytes(raw_guid);

        let list_size = read_u32(&data[16..20]) as usize;
        let header_size = read_u32(&data[20..24]) as usize;
        let sig_size = read_u32(&data[24..28]) as usize;

        if list_size < FIXED || list_size > data.len() {
            return Err(if list_size > data.len() {
                SigListError::Truncated
            } else {
                SigListError::BadLength
            });
        }

        let body = &data[FIXED..list_size];
        if header_size > body.len() {
            return Err(SigListError::BadLength);
        }

        let entries_raw = &body[header_size..];
        if sig_size < GUID_SIZE || entries_raw.len() % sig_size != 0 {
            return Err(SigListError::BadLength);
        }

        let mut entries = Vec::with_capacity(entries_raw.len() / sig_size);
        for chunk in entries_raw.chunks_exact(sig_size) {
            let mut raw_owner = [0u8; GUID_SIZE];
            raw_owner.copy_from_slice(&chunk[..GUID_SIZE]);
            entries.push(SignatureEntry {
                owner: Guid::from_bytes(raw_owner),
                data: chunk[GUID_SIZE..].to_vec(),
            });
        }

        Ok((SignatureList { sig_type, entries }, &data[list_size..]))
    }

    /// Serializes one list holding a single entry, the form the initial
    /// PK/KEK payloads and test fixtures use.
    pub fn single(sig_type: Guid, owner: Guid, data: &[u8]) -> Vec<u8> {
        let sig_size = (GUID_SIZE + data.len()) as u32;
        let list_size = 28 + sig_size;

        let mut out = Vec::with_capacity(list_size as usize);
        out.extend_from_slice(&sig_type.to_bytes());
        out.extend_from_slice(&list_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&sig_size.to_le_bytes());
        out.extend_from_slice(&owner.to_bytes());
        out.extend_from_slice(data);
        out
    }
}

/// All X.509 certificate entries across a parsed list set, in order.
pub fn x509_certs(lists: &[SignatureList]) -> impl Iterator<Item = &[u8]> {
    lists
        .iter()
        .filter(|l| l.sig_type == guid::EFI_CERT_X509)
        .flat_map(|l| l.entries.iter().map(|e| e.data.as_slice()))
}

/// True when any entry matches `needle`: byte-equal for X.509 entries,
/// digest-equal for SHA-256 entries. Used for the dbx veto.
pub fn contains_cert(lists: &[SignatureList], cert_der: &[u8], cert_sha256: &[u8; 32]) -> bool {
    lists.iter().any(|l| {
        if l.sig_type == guid::EFI_CERT_X509 {
            l.entries.iter().any(|e| e.data == cert_der)
        } else if l.sig_type == guid::EFI_CERT_SHA256 {
            l.entries.iter().any(|e| e.data == cert_sha256)
        } else {
            false
        }
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_round_trip() {
        let der = b"not really a certificate";
        let raw = SignatureList::single(guid::EFI_CERT_X509, guid::EFI_GLOBAL_VARIABLE, der);

        let lists = SignatureList::parse_all(&raw).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].sig_type, guid::EFI_CERT_X509);
        assert_eq!(lists[0].entries.len(), 1);
        assert_eq!(lists[0].entries[0].owner, guid::EFI_GLOBAL_VARIABLE);
        assert_eq!(lists[0].entries[0].data, der);

        let certs: Vec<&[u8]> = x509_certs(&lists).collect();
        assert_eq!(certs, vec![der.as_slice()]);
    }

    #[test]
    fn two_lists_concatenated() {
        let mut raw = SignatureList::single(guid::EFI_CERT_X509, Guid::default(), b"first");
        raw.extend_from_slice(&SignatureList::single(
            guid::EFI_CERT_SHA256,
            Guid::default(),
            &[0xaa; 32],
        ));

        let lists = SignatureList::parse_all(&raw).unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[1].entries[0].data, vec![0xaa; 32]);
    }

    #[test]
    fn dbx_veto_matches() {
        let cert = b"certificate der";
        let digest = [0x5a; 32];

        let by_cert = SignatureList::parse_all(&SignatureList::single(
            guid::EFI_CERT_X509,
            Guid::default(),
            cert,
        ))
        .unwrap();
        let by_hash = SignatureList::parse_all(&SignatureList::single(
            guid::EFI_CERT_SHA256,
            Guid::default(),
            &digest,
        ))
        .unwrap();

        assert!(contains_cert(&by_cert, cert, &digest));
        assert!(contains_cert(&by_hash, cert, &digest));
        assert!(!contains_cert(&by_cert, b"other", &[0; 32]));
    }

    #[test]
    fn rejects_truncation_and_bad_sizes() {
        let raw = SignatureList::single(guid::EFI_CERT_X509, Guid::default(), b"data");

        assert_eq!(
            SignatureList::parse_all(&raw[..10]),
            Err(SigListError::Truncated)
        );
        assert_eq!(
            SignatureList::parse_all(&raw[..raw.len() - 1]),
            Err(SigListError::Truncated)
        );

        // list_size smaller than the fixed header
        let mut bad = raw.clone();
        bad[16..20].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(SignatureList::parse_all(&bad), Err(SigListError::BadLength));

        // sig_size below the owner GUID
        let mut bad = raw;
        bad[24..28].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(SignatureList::parse_all(&bad), Err(SigListError::BadLength));
    }

    #[test]
    fn empty_buffer_is_empty_set() {
        assert_eq!(SignatureList::parse_all(&[]).unwrap(), Vec::new());
    }
}
