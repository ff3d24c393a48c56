//! A minimal DER reader.
//!
//! Just enough ASN.1 to walk X.509 certificates and PKCS#7 SignedData:
//! definite-length TLVs, nested readers for constructed types, and a few
//! typed accessors. Every step either yields a value and advances the
//! cursor or fails with a single error; there is no lookahead state to
//! corrupt on hostile input.

/// Universal tags this parser cares about.
pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const OID: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    /// Context-specific constructed [0].
    pub const CONTEXT_0: u8 = 0xa0;
    /// Context-specific constructed [1].
    pub const CONTEXT_1: u8 = 0xa1;
}

/// DER decode failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DerError {
    /// A length runs past the end of the buffer.
    Truncated,
    /// Unexpected tag.
    BadTag { expected: u8, found: u8 },
    /// Indefinite or oversized length encoding.
    BadLength,
    /// Structurally valid DER carrying the wrong content (e.g. an
    /// unexpected OID).
    Malformed,
}

pub type DerResult<T> = Result<T, DerError>;

/// A cursor over DER bytes.
#[derive(Debug, Clone, Copy)]
pub struct Der<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Der<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Der { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Tag of the next element, if any.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Reads one TLV with the given tag and returns its value bytes.
    pub fn value(&mut self, expected: u8) -> DerResult<&'a [u8]> {
        let (tag, header, len) = self.peek_header()?;
        if tag != expected {
            return Err(DerError::BadTag {
                expected,
                found: tag,
            });
        }
        let start = self.pos + header;
        self.pos = start + len;
        Ok(&self.buf[start..start + len])
    }

    /// Reads one TLV with the given tag and returns the whole element,
    /// header included. Used where the raw bytes get hashed or re-tagged.
    pub fn element(&mut self, expected: u8) -> DerResult<&'a [u8]> {
        let (tag, header, len) = self.peek_header()?;
        if tag != expected {
            return Err(DerError::BadTag {
                expected,
                found: tag,
            });
        }
        let start = self.pos;
        self.pos += header + len;
        Ok(&self.buf[start..self.pos])
    }

    /// Descends into a constructed element, yielding a reader over its
    /// contents.
    pub fn nested(&mut self, expected: u8) -> DerResult<Der<'a>> {
        Ok(Der::new(self.value(expected)?))
    }

    /// Skips one element of any tag.
    pub fn skip(&mut self) -> DerResult<()> {
        let (_, header, len) = self.peek_header()?;
        self.pos += header + len;
        Ok(())
    }

    /// Skips the next element if it carries `tag`. Returns whether it did.
    pub fn skip_optional(&mut self, tag: u8) -> DerResult<bool> {
        if self.peek_tag() == Some(tag) {
            self.skip()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// An INTEGER's raw content bytes (two's complement, as stored).
    pub fn integer(&mut self) -> DerResult<&'a [u8]> {
        self.value(tag::INTEGER)
    }

    /// An OBJECT IDENTIFIER's raw content bytes.
    pub fn oid(&mut self) -> DerResult<&'a [u8]> {
        self.value(tag::OID)
    }

    /// A BIT STRING's payload with the leading unused-bits octet stripped.
    /// Only whole-byte strings (unused = 0) are accepted.
    pub fn bit_string(&mut self) -> DerResult<&'a [u8]> {
        let raw = self.value(tag::BIT_STRING)?;
        match raw.split_first() {
            Some((0, rest)) => Ok(rest),
            _ => Err(DerError::BadLength),
        }
    }

    /// Parses tag + length without consuming. Returns (tag, header bytes,
    /// content length), bounds already validated.
    fn peek_header(&self) -> DerResult<(u8, usize, usize)> {
        let rest = &self.buf[self.pos..];
        if rest.len() < 2 {
            return Err(DerError::Truncated);
        }

        let tag = rest[0];
        let first = rest[1];

        let (header, len) = if first < 0x80 {
            (2, first as usize)
        } else {
            let count = (first & 0x7f) as usize;
            // 0x80 is the indefinite form, anything past four bytes cannot
            // index a buffer we would accept.
            if count == 0 || count > 4 || rest.len() < 2 + count {
                return Err(DerError::BadLength);
            }
            let mut len = 0usize;
            for &b in &rest[2..2 + count] {
                len = (len << 8) | b as usize;
            }
            if len < 0x80 {
                // Non-minimal encoding.
                return Err(DerError::BadLength);
            }
            (2 + count, len)
        };

        if len > rest.len() - header {
            return Err(DerError::Truncated);
        }
        Ok((tag, header, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles one TLV.
    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 0x80 {
            out.push(len as u8);
        } else if len <= 0xff {
            out.push(0x81);
            out.push(len as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    #[test]
    fn short_and_long_lengths() {
        let short = tlv(tag::OCTET_STRING, &[0xab; 5]);
        let mut d = Der::new(&short);
        assert_eq!(d.value(tag::OCTET_STRING).unwrap(), &[0xab; 5]);
        assert!(d.is_empty());

        let long = tlv(tag::OCTET_STRING, &[0xcd; 300]);
        let mut d = Der::new(&long);
        assert_eq!(d.value(tag::OCTET_STRING).unwrap().len(), 300);
    }

    #[test]
    fn nested_sequences() {
        let inner = tlv(tag::INTEGER, &[0x05]);
        let outer = tlv(tag::SEQUENCE, &inner);
        let mut d = Der::new(&outer);
        let mut seq = d.nested(tag::SEQUENCE).unwrap();
        assert_eq!(seq.integer().unwrap(), &[0x05]);
        assert!(seq.is_empty());
    }

    #[test]
    fn element_keeps_header() {
        let raw = tlv(tag::SEQUENCE, &[0x02, 0x01, 0x07]);
        let mut d = Der::new(&raw);
        assert_eq!(d.element(tag::SEQUENCE).unwrap(), raw.as_slice());
    }

    #[test]
    fn wrong_tag_reported() {
        let raw = tlv(tag::INTEGER, &[1]);
        let mut d = Der::new(&raw);
        assert_eq!(
            d.value(tag::SEQUENCE),
            Err(DerError::BadTag {
                expected: tag::SEQUENCE,
                found: tag::INTEGER
            })
        );
    }

    #[test]
    fn hostile_lengths() {
        // Truncated content.
        let mut d = Der::new(&[0x04, 0x05, 0x01]);
        assert_eq!(d.value(tag::OCTET_STRING), Err(DerError::Truncated));

        // Indefinite length.
        let mut d = Der::new(&[0x30, 0x80, 0x00, 0x00]);
        assert_eq!(d.nested(tag::SEQUENCE).map(|_| ()), Err(DerError::BadLength));

        // Length-of-length of five bytes.
        let mut d = Der::new(&[0x04, 0x85, 1, 1, 1, 1, 1]);
        assert_eq!(d.value(tag::OCTET_STRING), Err(DerError::BadLength));

        // Non-minimal long form.
        let mut d = Der::new(&[0x04, 0x81, 0x05, 1, 2, 3, 4, 5]);
        assert_eq!(d.value(tag::OCTET_STRING), Err(DerError::BadLength));
    }

    #[test]
    fn bit_string_unused_bits() {
        let raw = tlv(tag::BIT_STRING, &[0x00, 0xde, 0xad]);
        let mut d = Der::new(&raw);
        assert_eq!(d.bit_string().unwrap(), &[0xde, 0xad]);

        let raw = tlv(tag::BIT_STRING, &[0x03, 0xde]);
        let mut d = Der::new(&raw);
        assert_eq!(d.bit_string(), Err(DerError::BadLength));
    }

    #[test]
    fn skip_optional_context() {
        let ctx = tlv(tag::CONTEXT_0, &[0x02, 0x01, 0x02]);
        let mut raw = ctx.clone();
        raw.extend_from_slice(&tlv(tag::INTEGER, &[0x09]));

        let mut d = Der::new(&raw);
        assert!(d.skip_optional(tag::CONTEXT_0).unwrap());
        assert!(!d.skip_optional(tag::CONTEXT_0).unwrap());
        assert_eq!(d.integer().unwrap(), &[0x09]);
    }
}
