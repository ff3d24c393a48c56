//! The in-memory variable store and its snapshot round-trip.
//!
//! Records live in insertion order in a `Vec`; the count is capped at
//! `MAX_VAR_COUNT` so linear scans are fine. Enumeration takes a snapshot
//! of the identities present at the start of a pass and walks that, so a
//! GetNextVariableName sequence sees each record at most once even if the
//! store mutates between calls.

use xenvars_efi::{
    EfiTime, Guid, VarAttrs, VarName, MAX_VARIABLE_DATA_SIZE, MAX_VARIABLE_NAME_SIZE,
    MAX_VAR_COUNT,
};

use crate::codec::{
    CodecError, CodecResult, Reader, SNAPSHOT_MAGIC, SNAPSHOT_VERSION, VAR_PADDING,
};

/// One UEFI variable record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Variable {
    pub name: VarName,
    pub guid: Guid,
    pub data: Vec<u8>,
    pub attrs: VarAttrs,
    /// Meaningful only when `attrs` carries `TIME_BASED_AUTH`; zero
    /// otherwise.
    pub timestamp: EfiTime,
    /// Top-level DER certificate of the most recent verifying signer.
    /// Empty for unauthenticated variables.
    pub cert: Vec<u8>,
}

impl Variable {
    /// Serialized footprint used for QueryVariableInfo accounting: both
    /// length prefixes, the name, the data, GUID and attributes.
    pub fn serialized_size(&self) -> u64 {
        8 + self.name.to_bytes().len() as u64 + 8 + self.data.len() as u64 + 16 + 4
    }
}

/// Store mutation failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreError {
    NotFound,
    /// Record count or a per-variable size limit exceeded.
    OutOfResources,
}

/// Result of one enumeration step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NextVar {
    Item(VarName, Guid),
    End,
}

/// The variable store.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: Vec<Variable>,
    /// Identities captured at the start of the current enumeration pass.
    pass: Option<Vec<(VarName, Guid)>>,
}

impl VarStore {
    pub fn new() -> Self {
        VarStore::default()
    }

    pub fn count(&self) -> usize {
        self.vars.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    /// Total serialized footprint of all records.
    pub fn used_bytes(&self) -> u64 {
        self.vars.iter().map(Variable::serialized_size).sum()
    }

    pub fn get(&self, name: &VarName, guid: &Guid) -> Option<&Variable> {
        self.vars
            .iter()
            .find(|v| v.name == *name && v.guid == *guid)
    }

    /// Creates or replaces a record, enforcing the size and count limits.
    pub fn set(&mut self, var: Variable) -> Result<(), StoreError> {
        if var.data.len() > MAX_VARIABLE_DATA_SIZE
            || var.name.byte_len_with_nul() > MAX_VARIABLE_NAME_SIZE
        {
            return Err(StoreError::OutOfResources);
        }

        match self
            .vars
            .iter_mut()
            .find(|v| v.name == var.name && v.guid == var.guid)
        {
            Some(slot) => *slot = var,
            None => {
                if self.vars.len() >= MAX_VAR_COUNT {
                    return Err(StoreError::OutOfResources);
                }
                self.vars.push(var);
            }
        }
        Ok(())
    }

    /// Concatenates `extra` onto an existing record's data and advances its
    /// timestamp and signer certificate.
    pub fn append(
        &mut self,
        name: &VarName,
        guid: &Guid,
        extra: &[u8],
        timestamp: EfiTime,
        cert: &[u8],
    ) -> Result<(), StoreError> {
        let var = self
            .vars
            .iter_mut()
            .find(|v| v.name == *name && v.guid == *guid)
            .ok_or(StoreError::NotFound)?;

        if var.data.len() + extra.len() > MAX_VARIABLE_DATA_SIZE {
            return Err(StoreError::OutOfResources);
        }

        var.data.extend_from_slice(extra);
        if timestamp > var.timestamp {
            var.timestamp = timestamp;
        }
        if !cert.is_empty() {
            var.cert = cert.to_vec();
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &VarName, guid: &Guid) -> Result<(), StoreError> {
        let idx = self
            .vars
            .iter()
            .position(|v| v.name == *name && v.guid == *guid)
            .ok_or(StoreError::NotFound)?;
        self.vars.remove(idx);
        Ok(())
    }

    /// One GetNextVariableName step.
    ///
    /// `prev = None` (the empty name) starts a pass, or restarts one
    /// mid-flight. A previous identity that is no longer in the pass
    /// snapshot ends the pass. Reaching the end clears the pass state.
    pub fn next(&mut self, prev: Option<(&VarName, &Guid)>) -> NextVar {
        match prev {
            None => {
                let snapshot: Vec<(VarName, Guid)> = self
                    .vars
                    .iter()
                    .map(|v| (v.name.clone(), v.guid))
                    .collect();
                let first = snapshot.first().cloned();
                match first {
                    Some((name, guid)) => {
                        self.pass = Some(snapshot);
                        NextVar::Item(name, guid)
                    }
                    None => {
                        self.pass = None;
                        NextVar::End
                    }
                }
            }
            Some((name, guid)) => {
                if self.pass.is_none() {
                    // The guest resumed a pass we never saw start; walk the
                    // records currently present.
                    self.pass = Some(
                        self.vars
                            .iter()
                            .map(|v| (v.name.clone(), v.guid))
                            .collect(),
                    );
                }
                let Some(pass) = self.pass.as_ref() else {
                    return NextVar::End;
                };

                let pos = pass
                    .iter()
                    .position(|(n, g)| n == name && g == guid);

                match pos.and_then(|i| pass.get(i + 1)).cloned() {
                    Some((n, g)) => NextVar::Item(n, g),
                    None => {
                        self.pass = None;
                        NextVar::End
                    }
                }
            }
        }
    }

    /// Serializes every record behind the `VARS` header.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used_bytes() as usize + 16);
        out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.vars.len() as u64).to_le_bytes());

        for var in &self.vars {
            let name = var.name.to_bytes_with_nul();
            out.extend_from_slice(&(name.len() as u64).to_le_bytes());
            out.extend_from_slice(&name);
            out.extend_from_slice(&(var.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&var.data);
            out.extend_from_slice(&var.guid.to_bytes());
            out.extend_from_slice(&var.attrs.bits().to_le_bytes());
            out.extend_from_slice(&var.timestamp.to_bytes());
            out.extend_from_slice(&(var.cert.len() as u64).to_le_bytes());
            out.extend_from_slice(&var.cert);
            out.extend_from_slice(&[0u8; VAR_PADDING]);
        }
        out
    }

    /// Rebuilds a store from a snapshot. The inverse of [`snapshot`] for
    /// any store within limits.
    ///
    /// [`snapshot`]: VarStore::snapshot
    pub fn restore(blob: &[u8]) -> CodecResult<VarStore> {
        let mut r = Reader::new(blob);

        if r.u32()? != SNAPSHOT_MAGIC {
            return Err(CodecError::BadEncoding);
        }
        if r.u32()? != SNAPSHOT_VERSION {
            return Err(CodecError::BadEncoding);
        }

        let count = r.u64()?;
        if count > MAX_VAR_COUNT as u64 {
            return Err(CodecError::TooLarge);
        }

        let mut store = VarStore::new();
        for _ in 0..count {
            let name_raw = r.blob(MAX_VARIABLE_NAME_SIZE)?;
            let name = VarName::from_utf16le(name_raw).map_err(|_| CodecError::BadEncoding)?;
            let data = r.blob(MAX_VARIABLE_DATA_SIZE)?.to_vec();
            let guid = r.guid()?;
            let attrs =
                VarAttrs::from_bits(r.u32()?).ok_or(CodecError::BadEncoding)?;
            let timestamp = r.time()?;
            let cert = r.blob(MAX_VARIABLE_DATA_SIZE)?.to_vec();
            r.skip(VAR_PADDING)?;

            store
                .set(Variable {
                    name,
                    guid,
                    data,
                    attrs,
                    timestamp,
                    cert,
                })
                .map_err(|_| CodecError::TooLarge)?;
        }

        Ok(store)
    }
}
