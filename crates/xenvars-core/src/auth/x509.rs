//! Minimal X.509 certificate parsing.
//!
//! Extracts exactly the fields chain walking needs: the raw `tbsCertificate`
//! bytes, serial number, issuer and subject name blobs, the public key, and
//! the outer signature. Names are compared as raw DER; no RDN decoding.

use super::der::{tag, Der, DerError, DerResult};

/// sha256WithRSAEncryption (1.2.840.113549.1.1.11).
pub const OID_SHA256_WITH_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];

/// rsaEncryption (1.2.840.113549.1.1.1).
pub const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

/// id-sha256 (2.16.840.1.101.3.4.2.1).
pub const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// Signature algorithm of a certificate's outer signature.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SigAlg {
    /// RSA PKCS#1 v1.5 over SHA-256, the only algorithm this service
    /// verifies.
    RsaSha256,
    /// Anything else; chain links using it fail verification.
    Other,
}

/// A parsed certificate, borrowing from its DER buffer.
#[derive(Debug, Clone, Copy)]
pub struct Certificate<'a> {
    /// The whole certificate element.
    pub raw: &'a [u8],
    /// The `tbsCertificate` element, header included: the bytes the outer
    /// signature covers.
    pub tbs_raw: &'a [u8],
    /// Serial number content bytes.
    pub serial: &'a [u8],
    /// Issuer `Name` element, raw.
    pub issuer: &'a [u8],
    /// Subject `Name` element, raw.
    pub subject: &'a [u8],
    /// `subjectPublicKey` BIT STRING payload. For RSA keys this is the
    /// PKCS#1 `RSAPublicKey` structure `ring` consumes directly.
    pub public_key: &'a [u8],
    pub sig_alg: SigAlg,
    /// Outer signature BIT STRING payload.
    pub signature: &'a [u8],
}

impl<'a> Certificate<'a> {
    /// Parses one certificate from the front of a cursor.
    pub fn parse_from(der: &mut Der<'a>) -> DerResult<Certificate<'a>> {
        let raw = der.element(tag::SEQUENCE)?;

        let mut cert = Der::new(raw);
        let mut body = cert.nested(tag::SEQUENCE)?;

        let tbs_raw = body.element(tag::SEQUENCE)?;

        let mut alg = body.nested(tag::SEQUENCE)?;
        let sig_alg = match alg.oid()? {
            OID_SHA256_WITH_RSA => SigAlg::RsaSha256,
            _ => SigAlg::Other,
        };

        let signature = body.bit_string()?;

        // Walk the to-be-signed body for the identity fields.
        let mut tbs = Der::new(tbs_raw);
        let mut tbs = tbs.nested(tag::SEQUENCE)?;

        tbs.skip_optional(tag::CONTEXT_0)?; // version
        let serial = tbs.integer()?;
        tbs.skip()?; // signature algorithm (repeated)
        let issuer = tbs.element(tag::SEQUENCE)?;
        tbs.skip()?; // validity; firmware has no trustworthy clock
        let subject = tbs.element(tag::SEQUENCE)?;

        let mut spki = tbs.nested(tag::SEQUENCE)?;
        spki.skip()?; // key algorithm
        let public_key = spki.bit_string()?;

        Ok(Certificate {
            raw,
            tbs_raw,
            serial,
            issuer,
            subject,
            public_key,
            sig_alg,
            signature,
        })
    }

    /// Parses a buffer holding exactly one certificate.
    pub fn parse(raw: &'a [u8]) -> DerResult<Certificate<'a>> {
        let mut der = Der::new(raw);
        let cert = Self::parse_from(&mut der)?;
        if !der.is_empty() {
            return Err(DerError::BadLength);
        }
        Ok(cert)
    }

    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.subject
    }
}
