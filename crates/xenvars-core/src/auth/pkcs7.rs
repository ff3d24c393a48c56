//! PKCS#7 SignedData verification.
//!
//! The authentication descriptor of a time-based write carries a DER
//! SignedData, with or without its `ContentInfo` wrapper. Verification is a
//! pure function over `(signed data, message, trusted roots)`:
//!
//! 1. wrap bare SignedData in a `ContentInfo` when the fixed 19-byte prefix
//!    is absent,
//! 2. parse certificates and the first signer info,
//! 3. check the signature — over the message directly, or over the
//!    authenticated attributes after the `messageDigest` attribute has been
//!    matched against the message digest,
//! 4. walk issuer links until a trusted root is reached.
//!
//! Certificate time validity is deliberately ignored (there is no
//! trustworthy clock), partial chains ending in any trusted certificate are
//! accepted, and extended key usage is not checked.

use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
use sha2::{Digest, Sha256};

use super::der::{tag, Der, DerResult};
use super::x509::{Certificate, SigAlg};

/// DER content bytes of the pkcs7-signedData OID (1.2.840.113549.1.7.2).
const OID_SIGNED_DATA: [u8; 9] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

/// messageDigest attribute OID (1.2.840.113549.1.9.4).
const OID_MESSAGE_DIGEST: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x04];

/// Maximum issuer links walked before a chain is called circular.
const MAX_CHAIN_DEPTH: usize = 8;

/// Why verification failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VerifyError {
    /// The SignedData or an embedded certificate does not parse.
    Parse,
    /// No embedded certificate matches the signer info.
    NoSigner,
    /// A digest or signature algorithm other than SHA-256/RSA.
    UnsupportedAlgorithm,
    /// The `messageDigest` attribute or a signature does not check out.
    BadSignature,
    /// No path from the signer to any trusted root.
    UntrustedChain,
}

/// The outcome of a successful verification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VerifiedSigner {
    /// DER of the leaf certificate that produced the signature.
    pub signer: Vec<u8>,
    /// DER of the topmost embedded certificate on the accepted chain; equal
    /// to `signer` for self-signed or directly-trusted signers. This is
    /// what the store retains for same-signer append checks.
    pub top_level: Vec<u8>,
}

/// True when `data` already starts with a `ContentInfo` wrapper, detected
/// by the fixed prefix `30 82 LL LL 06 09 <signedData OID> A0 82`.
pub fn is_content_info(data: &[u8]) -> bool {
    data.len() >= 19
        && data[4] == 0x06
        && data[5] == 0x09
        && data[6..15] == OID_SIGNED_DATA
        && data[15] == 0xa0
        && data[16] == 0x82
}

/// Prepends the 19-byte `ContentInfo` header to a bare SignedData.
///
/// The header encodes both lengths in 16 bits, which bounds the input; the
/// shared page keeps real payloads far below that.
pub fn wrap_with_content_info(data: &[u8]) -> Option<Vec<u8>> {
    let wrapped_len = data.len().checked_add(19)?;
    if wrapped_len > u16::MAX as usize {
        return None;
    }

    let mut out = Vec::with_capacity(wrapped_len);
    out.extend_from_slice(&[0x30, 0x82]);
    out.extend_from_slice(&((wrapped_len - 4) as u16).to_be_bytes());
    out.extend_from_slice(&[0x06, 0x09]);
    out.extend_from_slice(&OID_SIGNED_DATA);
    out.extend_from_slice(&[0xa0, 0x82]);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    Some(out)
}

/// One parsed signer info.
#[derive(Debug, Clone, Copy)]
struct SignerInfo<'a> {
    issuer: &'a [u8],
    serial: &'a [u8],
    /// Full `[0]` authenticatedAttributes element, when present.
    signed_attrs_raw: Option<&'a [u8]>,
    signature: &'a [u8],
}

/// The parts of a SignedData verification needs.
struct SignedData<'a> {
    certs: Vec<Certificate<'a>>,
    signer_info: SignerInfo<'a>,
}

fn parse_signed_data<'a>(wrapped: &'a [u8]) -> DerResult<SignedData<'a>> {
    let mut top = Der::new(wrapped);
    let mut content_info = top.nested(tag::SEQUENCE)?;

    let oid = content_info.oid()?;
    if oid != OID_SIGNED_DATA {
        return Err(super::der::DerError::Malformed);
    }

    let mut explicit = content_info.nested(tag::CONTEXT_0)?;
    let mut signed_data = explicit.nested(tag::SEQUENCE)?;

    signed_data.integer()?; // version
    signed_data.skip()?; // digestAlgorithms
    signed_data.skip()?; // encapContentInfo

    let mut certs = Vec::new();
    if signed_data.peek_tag() == Some(tag::CONTEXT_0) {
        let mut cert_set = signed_data.nested(tag::CONTEXT_0)?;
        while !cert_set.is_empty() {
            certs.push(Certificate::parse_from(&mut cert_set)?);
        }
    }
    signed_data.skip_optional(tag::CONTEXT_1)?; // crls

    let mut signer_infos = signed_data.nested(tag::SET)?;
    let mut si = signer_infos.nested(tag::SEQUENCE)?;

    si.integer()?; // version
    let mut issuer_and_serial = si.nested(tag::SEQUENCE)?;
    let issuer = issuer_and_serial.element(tag::SEQUENCE)?;
    let serial = issuer_and_serial.integer()?;
    si.skip()?; // digestAlgorithm

    let signed_attrs_raw = if si.peek_tag() == Some(tag::CONTEXT_0) {
        Some(si.element(tag::CONTEXT_0)?)
    } else {
        None
    };

    si.skip()?; // digestEncryptionAlgorithm
    let signature = si.value(tag::OCTET_STRING)?;

    Ok(SignedData {
        certs,
        signer_info: SignerInfo {
            issuer,
            serial,
            signed_attrs_raw,
            signature,
        },
    })
}

/// Pulls the `messageDigest` attribute value out of the authenticated
/// attributes.
fn message_digest_attr<'a>(attrs_raw: &'a [u8]) -> Option<&'a [u8]> {
    let mut outer = Der::new(attrs_raw);
    let mut attrs = outer.nested(tag::CONTEXT_0).ok()?;

    while !attrs.is_empty() {
        let mut attr = attrs.nested(tag::SEQUENCE).ok()?;
        let oid = attr.oid().ok()?;
        let mut values = attr.nested(tag::SET).ok()?;
        if oid == OID_MESSAGE_DIGEST {
            return values.value(tag::OCTET_STRING).ok();
        }
    }
    None
}

fn rsa_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
    UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, public_key)
        .verify(message, signature)
        .map_err(|_| VerifyError::BadSignature)
}

/// Checks one issuer link: `child`'s outer signature under `parent`'s key.
fn verify_issued_by(child: &Certificate<'_>, parent: &Certificate<'_>) -> Result<(), VerifyError> {
    if child.sig_alg != SigAlg::RsaSha256 {
        return Err(VerifyError::UnsupportedAlgorithm);
    }
    rsa_verify(parent.public_key, child.tbs_raw, child.signature)
}

/// Verifies a PKCS#7 SignedData over `message` against `roots`.
///
/// `roots` are DER certificates supplied by value per call; any chain that
/// reaches one of them byte-for-byte, or that is issued directly by one,
/// is accepted.
pub fn verify(
    p7: &[u8],
    message: &[u8],
    roots: &[Vec<u8>],
) -> Result<VerifiedSigner, VerifyError> {
    let wrapped_storage;
    let wrapped: &[u8] = if is_content_info(p7) {
        p7
    } else {
        wrapped_storage = wrap_with_content_info(p7).ok_or(VerifyError::Parse)?;
        &wrapped_storage
    };

    let parsed = parse_signed_data(wrapped).map_err(|_| VerifyError::Parse)?;
    let si = parsed.signer_info;

    let signer = parsed
        .certs
        .iter()
        .find(|c| c.issuer == si.issuer && c.serial == si.serial)
        .ok_or(VerifyError::NoSigner)?;

    // Signature check: over the re-tagged authenticated attributes when
    // present, over the message directly otherwise.
    match si.signed_attrs_raw {
        Some(attrs_raw) => {
            let digest = message_digest_attr(attrs_raw).ok_or(VerifyError::BadSignature)?;
            let computed = Sha256::digest(message);
            if digest != computed.as_slice() {
                return Err(VerifyError::BadSignature);
            }

            // The signature covers the attributes re-encoded as SET OF.
            let mut retagged = attrs_raw.to_vec();
            retagged[0] = tag::SET;
            rsa_verify(signer.public_key, &retagged, si.signature)?;
        }
        None => rsa_verify(signer.public_key, message, si.signature)?,
    }

    // Chain walk from the signer up to a trusted root. A root matches
    // byte-for-byte, or by issuing the current certificate; either ends the
    // chain (partial chains are fine, self-signedness is not required).
    let parsed_roots: Vec<Certificate<'_>> = roots
        .iter()
        .filter_map(|r| Certificate::parse(r).ok())
        .collect();

    let mut current = *signer;
    let mut top_level = signer.raw.to_vec();

    for _ in 0..=MAX_CHAIN_DEPTH {
        if parsed_roots.iter().any(|r| r.raw == current.raw) {
            return Ok(VerifiedSigner {
                signer: signer.raw.to_vec(),
                top_level,
            });
        }

        if let Some(root) = parsed_roots.iter().find(|r| r.subject == current.issuer) {
            verify_issued_by(&current, root)?;
            return Ok(VerifiedSigner {
                signer: signer.raw.to_vec(),
                top_level,
            });
        }

        let parent = parsed
            .certs
            .iter()
            .find(|c| c.subject == current.issuer && c.raw != current.raw);
        match parent {
            Some(parent) => {
                verify_issued_by(&current, parent)?;
                current = *parent;
                top_level = parent.raw.to_vec();
            }
            None => return Err(VerifyError::UntrustedChain),
        }
    }

    Err(VerifyError::UntrustedChain)
}
