//! UTF-16LE variable names.
//!
//! A name is stored as its code units without the terminator; the wire and
//! snapshot layers decide whether a terminator travels with it. The byte
//! limit (`MAX_VARIABLE_NAME_SIZE`) always accounts for the terminator.

use core::fmt;

use crate::MAX_VARIABLE_NAME_SIZE;

/// An owned UTF-16 variable name. Half of a variable's identity.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default)]
pub struct VarName(Vec<u16>);

/// Reason a name was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NameError {
    /// A UTF-16LE byte string must have even length.
    OddLength,
    /// Empty names are not valid identities.
    Empty,
    /// An interior NUL code unit.
    InteriorNul,
    /// Longer than `MAX_VARIABLE_NAME_SIZE` bytes including terminator.
    TooLong,
    /// Not representable in UCS-2.
    Encoding,
}

impl VarName {
    /// Builds a name from raw UTF-16LE bytes as they appear on the wire.
    ///
    /// A single trailing NUL code unit is accepted and stripped.
    pub fn from_utf16le(bytes: &[u8]) -> Result<Self, NameError> {
        if bytes.len() % 2 != 0 {
            return Err(NameError::OddLength);
        }

        let mut units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        if units.last() == Some(&0) {
            units.pop();
        }

        Self::from_units(units)
    }

    /// Builds a name from bare code units (no terminator).
    pub fn from_units(units: Vec<u16>) -> Result<Self, NameError> {
        if units.is_empty() {
            return Err(NameError::Empty);
        }
        if units.contains(&0) {
            return Err(NameError::InteriorNul);
        }
        if (units.len() + 1) * 2 > MAX_VARIABLE_NAME_SIZE {
            return Err(NameError::TooLong);
        }
        Ok(VarName(units))
    }

    /// Builds a name from ASCII/UTF-8 text, as used for the well-known
    /// variable names ("PK", "KEK", "db", "dbx", ...).
    pub fn from_str(name: &str) -> Result<Self, NameError> {
        let mut buf = vec![0u16; name.len()];
        let used = ucs2::encode(name, &mut buf).map_err(|_| NameError::Encoding)?;
        buf.truncate(used);
        Self::from_units(buf)
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    /// UTF-16LE bytes without terminator, the form the authentication digest
    /// hashes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    /// UTF-16LE bytes with the NUL terminator, the form GetNextVariableName
    /// returns.
    pub fn to_bytes_with_nul(&self) -> Vec<u8> {
        let mut out = self.to_bytes();
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Size in bytes including the terminator.
    pub fn byte_len_with_nul(&self) -> usize {
        (self.0.len() + 1) * 2
    }
}

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Worst case a UCS-2 code unit decodes to three UTF-8 bytes.
        let mut buf = vec![0u8; self.0.len() * 3];
        match ucs2::decode(&self.0, &mut buf) {
            Ok(used) => match core::str::from_utf8(&buf[..used]) {
                Ok(s) => f.write_str(s),
                Err(_) => f.write_str("<invalid>"),
            },
            Err(_) => f.write_str("<invalid>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_and_back() {
        let name = VarName::from_str("BootOrder").unwrap();
        assert_eq!(name.units().len(), 9);
        assert_eq!(format!("{name}"), "BootOrder");
        assert_eq!(name.byte_len_with_nul(), 20);
    }

    #[test]
    fn wire_forms() {
        let name = VarName::from_str("PK").unwrap();
        assert_eq!(name.to_bytes(), vec![b'P', 0, b'K', 0]);
        assert_eq!(name.to_bytes_with_nul(), vec![b'P', 0, b'K', 0, 0, 0]);
    }

    #[test]
    fn trailing_nul_stripped() {
        let with_nul = VarName::from_utf16le(&[b'd', 0, b'b', 0, 0, 0]).unwrap();
        let without = VarName::from_utf16le(&[b'd', 0, b'b', 0]).unwrap();
        assert_eq!(with_nul, without);
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(VarName::from_utf16le(&[b'a']), Err(NameError::OddLength));
        assert_eq!(VarName::from_utf16le(&[]), Err(NameError::Empty));
        assert_eq!(VarName::from_utf16le(&[0, 0]), Err(NameError::Empty));
        assert_eq!(
            VarName::from_utf16le(&[b'a', 0, 0, 0, b'b', 0]),
            Err(NameError::InteriorNul)
        );

        let long: Vec<u8> = core::iter::repeat([b'x', 0]).take(128).flatten().collect();
        assert_eq!(VarName::from_utf16le(&long), Err(NameError::TooLong));

        let just_fits: Vec<u8> = core::iter::repeat([b'x', 0]).take(127).flatten().collect();
        assert!(VarName::from_utf16le(&just_fits).is_ok());
    }
}
