//! Hand-assembled DER fixtures for the auth tests.
//!
//! These build structurally valid certificates and SignedData blobs with
//! nonsense key and signature bytes: enough to drive every parser and
//! policy path. Anything that must pass an actual RSA check needs real
//! fixtures produced with efitools.

use super::der::tag;
use super::x509::{OID_RSA_ENCRYPTION, OID_SHA256, OID_SHA256_WITH_RSA};

/// One TLV with a short or two-byte length.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    if content.len() < 0x80 {
        out.push(content.len() as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(content);
    out
}

/// `AlgorithmIdentifier ::= SEQUENCE { OID, NULL }`.
pub fn alg_id(oid: &[u8]) -> Vec<u8> {
    let mut inner = tlv(tag::OID, oid);
    inner.extend_from_slice(&[0x05, 0x00]);
    tlv(tag::SEQUENCE, &inner)
}

/// A structurally valid certificate with the given names and serial.
pub fn synthetic_cert(issuer_cn: &[u8], subject_cn: &[u8], serial: &[u8]) -> Vec<u8> {
    let issuer = tlv(tag::SEQUENCE, issuer_cn);
    let subject = tlv(tag::SEQUENCE, subject_cn);
    let validity = tlv(tag::SEQUENCE, &[]);

    let mut key_bits = vec![0x00];
    key_bits.extend_from_slice(&[0x11; 16]);
    let mut spki = alg_id(OID_RSA_ENCRYPTION);
    spki.extend_from_slice(&tlv(tag::BIT_STRING, &key_bits));
    let spki = tlv(tag::SEQUENCE, &spki);

    let mut tbs = Vec::new();
    tbs.extend_from_slice(&tlv(tag::INTEGER, serial));
    tbs.extend_from_slice(&alg_id(OID_SHA256_WITH_RSA));
    tbs.extend_from_slice(&issuer);
    tbs.extend_from_slice(&validity);
    tbs.extend_from_slice(&subject);
    tbs.extend_from_slice(&spki);
    let tbs = tlv(tag::SEQUENCE, &tbs);

    let mut sig_bits = vec![0x00];
    sig_bits.extend_from_slice(&[0x22; 32]);

    let mut cert = tbs;
    cert.extend_from_slice(&alg_id(OID_SHA256_WITH_RSA));
    cert.extend_from_slice(&tlv(tag::BIT_STRING, &sig_bits));
    tlv(tag::SEQUENCE, &cert)
}

/// A bare SignedData (no ContentInfo) holding one certificate and one
/// signer info. `si_serial` lets the signer info reference a different
/// serial than the certificate carries.
pub fn synthetic_signed_data(
    issuer_cn: &[u8],
    subject_cn: &[u8],
    cert_serial: &[u8],
    si_serial: &[u8],
) -> Vec<u8> {
    let cert = synthetic_cert(issuer_cn, subject_cn, cert_serial);

    let issuer = tlv(tag::SEQUENCE, issuer_cn);
    let mut ias = issuer;
    ias.extend_from_slice(&tlv(tag::INTEGER, si_serial));
    let ias = tlv(tag::SEQUENCE, &ias);

    let alg = alg_id(OID_SHA256);

    let mut si = tlv(tag::INTEGER, &[0x01]);
    si.extend_from_slice(&ias);
    si.extend_from_slice(&alg.clone());
    si.extend_from_slice(&alg);
    si.extend_from_slice(&tlv(tag::OCTET_STRING, &[0x5a; 32]));
    let si = tlv(tag::SEQUENCE, &si);
    let signer_infos = tlv(tag::SET, &si);

    let mut body = tlv(tag::INTEGER, &[0x01]); // version
    body.extend_from_slice(&tlv(tag::SET, &[])); // digestAlgorithms
    body.extend_from_slice(&tlv(tag::SEQUENCE, &[])); // encapContentInfo
    body.extend_from_slice(&tlv(tag::CONTEXT_0, &cert));
    body.extend_from_slice(&signer_infos);
    tlv(tag::SEQUENCE, &body)
}
