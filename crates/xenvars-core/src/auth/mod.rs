//! The authenticated-variable engine.
//!
//! Evaluates every SetVariable against the UEFI time-based authentication
//! rules: descriptor parsing, timestamp monotonicity, the PK → KEK → db/dbx
//! key hierarchy, the dbx veto, append semantics and setup-mode bypass.
//! The outcome is a [`WritePlan`] the dispatcher applies to the store; the
//! engine itself never mutates anything.

pub mod der;
pub mod pkcs7;
pub mod x509;

#[cfg(test)]
pub(crate) mod testutil;

use log::warn;
use sha2::{Digest, Sha256};

use xenvars_efi::guid::{EFI_GLOBAL_VARIABLE, EFI_IMAGE_SECURITY_DATABASE};
use xenvars_efi::signature::{contains_cert, x509_certs, SignatureList};
use xenvars_efi::{EfiTime, Guid, VarAttrs, VarName};

use crate::codec::Reader;
use crate::store::{Variable, VarStore};
use crate::{Config, ServiceError};

/// `WIN_CERTIFICATE.wCertificateType` for an EFI GUID certificate.
pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0ef1;

/// `WIN_CERTIFICATE.wRevision` this service accepts.
pub const WIN_CERT_REVISION: u16 = 0x0200;

/// Fixed bytes of `WIN_CERTIFICATE_UEFI_GUID` before `CertData`:
/// the 8-byte header plus the certificate-type GUID.
const WIN_CERT_FIXED: u32 = 8 + 16;

/// A parsed `EFI_VARIABLE_AUTHENTICATION_2` descriptor and the payload
/// behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthDescriptor<'a> {
    pub timestamp: EfiTime,
    /// The PKCS#7 SignedData, possibly without its ContentInfo wrapper.
    pub cert_data: &'a [u8],
    /// The variable data that follows the descriptor.
    pub payload: &'a [u8],
}

/// Splits authenticated write data into descriptor and payload.
pub fn parse_descriptor(data: &[u8]) -> Result<AuthDescriptor<'_>, ServiceError> {
    let mut r = Reader::new(data);

    let timestamp = r.time().map_err(|_| ServiceError::InvalidParameter)?;
    let dw_length = r.u32().map_err(|_| ServiceError::InvalidParameter)?;
    let w_revision = r.u16().map_err(|_| ServiceError::InvalidParameter)?;
    let w_cert_type = r.u16().map_err(|_| ServiceError::InvalidParameter)?;
    let cert_type = r.guid().map_err(|_| ServiceError::InvalidParameter)?;

    if w_revision != WIN_CERT_REVISION
        || w_cert_type != WIN_CERT_TYPE_EFI_GUID
        || cert_type != xenvars_efi::guid::EFI_CERT_TYPE_PKCS7
    {
        return Err(ServiceError::InvalidParameter);
    }

    let cert_len = dw_length
        .checked_sub(WIN_CERT_FIXED)
        .ok_or(ServiceError::InvalidParameter)?;
    let cert_data = r
        .bytes(cert_len as usize)
        .map_err(|_| ServiceError::InvalidParameter)?;
    let payload = r.rest();

    Ok(AuthDescriptor {
        timestamp,
        cert_data,
        payload,
    })
}

/// The policy class of a variable identity.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VarClass {
    Pk,
    Kek,
    Db,
    Dbx,
    /// Any other variable, authenticated or not.
    Other,
}

impl VarClass {
    pub fn of(name: &VarName, guid: &Guid) -> VarClass {
        let is = |s: &str| VarName::from_str(s).map_or(false, |n| n == *name);

        if *guid == EFI_GLOBAL_VARIABLE {
            if is("PK") {
                return VarClass::Pk;
            }
            if is("KEK") {
                return VarClass::Kek;
            }
        } else if *guid == EFI_IMAGE_SECURITY_DATABASE {
            if is("db") {
                return VarClass::Db;
            }
            if is("dbx") {
                return VarClass::Dbx;
            }
        }
        VarClass::Other
    }

    fn is_policy(self) -> bool {
        self != VarClass::Other
    }
}

/// Setup mode holds while no PK is installed.
pub fn setup_mode(store: &VarStore) -> bool {
    pk_identity()
        .map(|(name, guid)| store.get(&name, &guid).is_none())
        .unwrap_or(true)
}

fn pk_identity() -> Option<(VarName, Guid)> {
    VarName::from_str("PK").ok().map(|n| (n, EFI_GLOBAL_VARIABLE))
}

/// What the dispatcher should do to the store after a successful
/// evaluation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WritePlan {
    /// Remove the record.
    Delete,
    /// Create or overwrite the record.
    Replace(Variable),
    /// Concatenate onto the existing record.
    Append {
        data: Vec<u8>,
        timestamp: EfiTime,
        cert: Vec<u8>,
    },
    /// Nothing to do (an append with an empty payload).
    Noop,
}

/// Evaluates a SetVariable request. `attrs` has already passed the
/// attribute legality table; `attrs.bits()` is the exact word the guest
/// submitted and is what the signed digest covers.
pub fn evaluate_write(
    config: &Config,
    store: &VarStore,
    name: &VarName,
    guid: &Guid,
    attrs: VarAttrs,
    data: &[u8],
) -> Result<WritePlan, ServiceError> {
    let class = VarClass::of(name, guid);
    let existing = store.get(name, guid);

    // Zero attributes request deletion under the existing record's rules.
    if attrs.is_empty() {
        let existing = existing.ok_or(ServiceError::NotFound)?;
        if existing.attrs.time_based_auth() {
            let desc = parse_descriptor(data)?;
            check_timestamp(&desc, Some(existing), false)?;
            authenticate(config, store, class, name, guid, attrs, &desc)?;
        }
        return Ok(WritePlan::Delete);
    }

    if !attrs.time_based_auth() {
        if class.is_policy() {
            // PK/KEK/db/dbx writes must take the authenticated path.
            return Err(ServiceError::InvalidParameter);
        }

        if let Some(existing) = existing {
            if existing.attrs != attrs.stored() {
                return Err(ServiceError::WriteProtected);
            }
        }

        if data.is_empty() {
            existing.ok_or(ServiceError::NotFound)?;
            return Ok(WritePlan::Delete);
        }

        if attrs.append_write() && existing.is_some() {
            return Ok(WritePlan::Append {
                data: data.to_vec(),
                timestamp: EfiTime::default(),
                cert: Vec::new(),
            });
        }

        return Ok(WritePlan::Replace(Variable {
            name: name.clone(),
            guid: *guid,
            data: data.to_vec(),
            attrs: attrs.stored(),
            timestamp: EfiTime::default(),
            cert: Vec::new(),
        }));
    }

    // Time-based authenticated path.
    if class.is_policy() && attrs.stored() != VarAttrs::POLICY {
        return Err(ServiceError::InvalidParameter);
    }

    let append = attrs.append_write();
    let desc = parse_descriptor(data)?;

    if let Some(existing) = existing {
        if existing.attrs != attrs.stored() {
            return Err(ServiceError::WriteProtected);
        }
    }
    check_timestamp(&desc, existing, append)?;

    let top_cert = authenticate(config, store, class, name, guid, attrs, &desc)?;

    if class.is_policy() {
        validate_policy_payload(class, desc.payload, append)?;
    }

    if desc.payload.is_empty() {
        if append {
            return Ok(WritePlan::Noop);
        }
        existing.ok_or(ServiceError::NotFound)?;
        return Ok(WritePlan::Delete);
    }

    if append && existing.is_some() {
        return Ok(WritePlan::Append {
            data: desc.payload.to_vec(),
            timestamp: desc.timestamp,
            cert: top_cert,
        });
    }

    Ok(WritePlan::Replace(Variable {
        name: name.clone(),
        guid: *guid,
        data: desc.payload.to_vec(),
        attrs: attrs.stored(),
        timestamp: desc.timestamp,
        cert: top_cert,
    }))
}

/// Timestamp sanity and monotonicity: strictly greater for replace and
/// delete, greater-or-equal for append. The reserved fields must be zero.
fn check_timestamp(
    desc: &AuthDescriptor<'_>,
    existing: Option<&Variable>,
    append: bool,
) -> Result<(), ServiceError> {
    if !desc.timestamp.pads_clear() {
        return Err(ServiceError::SecurityViolation);
    }

    if let Some(existing) = existing {
        if existing.attrs.time_based_auth() {
            let ok = if append {
                desc.timestamp >= existing.timestamp
            } else {
                desc.timestamp > existing.timestamp
            };
            if !ok {
                return Err(ServiceError::SecurityViolation);
            }
        }
    }
    Ok(())
}

/// Runs the PKCS#7 verification under the policy roots for `class`.
///
/// Returns the top-level certificate to retain on the record; empty when
/// verification was bypassed (setup mode, or permissive enforcement after
/// a failure on a non-policy variable).
fn authenticate(
    config: &Config,
    store: &VarStore,
    class: VarClass,
    name: &VarName,
    guid: &Guid,
    attrs: VarAttrs,
    desc: &AuthDescriptor<'_>,
) -> Result<Vec<u8>, ServiceError> {
    if class.is_policy() && setup_mode(store) {
        return Ok(Vec::new());
    }

    let message = signed_payload(name, guid, attrs.bits(), desc.timestamp, desc.payload);
    let roots = policy_roots(store, class);

    match pkcs7::verify(desc.cert_data, &message, &roots) {
        Ok(signer) => {
            if class == VarClass::Other && signer_vetoed(store, &signer.signer) {
                return Err(ServiceError::SecurityViolation);
            }
            Ok(signer.top_level)
        }
        Err(err) => {
            if class == VarClass::Other && !config.enforcing {
                warn!("accepting unverified write to {name} ({guid}): {err:?}");
                return Ok(Vec::new());
            }
            Err(ServiceError::SecurityViolation)
        }
    }
}

/// The byte string the PKCS#7 signature must cover:
/// `name (no terminator) || vendor_guid || attrs || timestamp || payload`.
fn signed_payload(
    name: &VarName,
    guid: &Guid,
    attrs_raw: u32,
    timestamp: EfiTime,
    payload: &[u8],
) -> Vec<u8> {
    let name_bytes = name.to_bytes();
    let mut out = Vec::with_capacity(name_bytes.len() + 16 + 4 + 16 + payload.len());
    out.extend_from_slice(&name_bytes);
    out.extend_from_slice(&guid.to_bytes());
    out.extend_from_slice(&attrs_raw.to_le_bytes());
    out.extend_from_slice(&timestamp.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Trusted roots for a write to `class`, copied out of the store per call.
fn policy_roots(store: &VarStore, class: VarClass) -> Vec<Vec<u8>> {
    let mut roots = Vec::new();
    match class {
        VarClass::Pk | VarClass::Kek => {
            roots.extend(stored_certs(store, "PK", &EFI_GLOBAL_VARIABLE));
        }
        VarClass::Db | VarClass::Dbx => {
            roots.extend(stored_certs(store, "PK", &EFI_GLOBAL_VARIABLE));
            roots.extend(stored_certs(store, "KEK", &EFI_GLOBAL_VARIABLE));
        }
        VarClass::Other => {
            roots.extend(stored_certs(store, "PK", &EFI_GLOBAL_VARIABLE));
            roots.extend(stored_certs(store, "KEK", &EFI_GLOBAL_VARIABLE));
            roots.extend(stored_certs(store, "db", &EFI_IMAGE_SECURITY_DATABASE));
        }
    }
    roots
}

/// X.509 entries of a stored signature-list variable.
fn stored_certs(store: &VarStore, name: &str, guid: &Guid) -> Vec<Vec<u8>> {
    let Ok(name) = VarName::from_str(name) else {
        return Vec::new();
    };
    let Some(var) = store.get(&name, guid) else {
        return Vec::new();
    };
    // Stored policy data was validated on the way in.
    match SignatureList::parse_all(&var.data) {
        Ok(lists) => x509_certs(&lists).map(|c| c.to_vec()).collect(),
        Err(_) => Vec::new(),
    }
}

/// True when the signer certificate appears in dbx, by bytes or by digest.
fn signer_vetoed(store: &VarStore, signer_der: &[u8]) -> bool {
    let Ok(name) = VarName::from_str("dbx") else {
        return false;
    };
    let Some(dbx) = store.get(&name, &EFI_IMAGE_SECURITY_DATABASE) else {
        return false;
    };
    let Ok(lists) = SignatureList::parse_all(&dbx.data) else {
        return false;
    };

    let digest: [u8; 32] = Sha256::digest(signer_der).into();
    contains_cert(&lists, signer_der, &digest)
}

/// Policy-variable payloads must be well-formed signature lists; a PK
/// replace must carry exactly one X.509 certificate.
fn validate_policy_payload(
    class: VarClass,
    payload: &[u8],
    append: bool,
) -> Result<(), ServiceError> {
    if payload.is_empty() {
        return Ok(());
    }

    let lists =
        SignatureList::parse_all(payload).map_err(|_| ServiceError::InvalidParameter)?;

    if class == VarClass::Pk && !append && x509_certs(&lists).count() != 1 {
        return Err(ServiceError::InvalidParameter);
    }
    Ok(())
}
