//! The XenVariable request/response protocol.
//!
//! The guest firmware serializes one runtime-service call into the shared
//! page; [`Service::handle`] parses it, runs it against the store, and
//! overwrites the same region with the reply. The page is guest-controlled
//! from the first byte to the last: every read goes through the bounded
//! [`Reader`], every write through the bounded [`Writer`], and no input can
//! panic the dispatcher.
//!
//! Framing: `u32 version (=1) | u32 command | payload`, all little-endian.
//! Strings are a `u64` byte count followed by raw UTF-16LE.

use log::debug;

use xenvars_efi::{
    EfiStatus, Guid, VarAttrs, VarName, MAX_VARIABLE_DATA_SIZE, MAX_VARIABLE_NAME_SIZE,
    MAX_VAR_COUNT, SHMEM_SIZE,
};

use crate::auth::{self, WritePlan};
use crate::codec::{CodecResult, Reader, Writer};
use crate::store::{NextVar, StoreError, VarStore};
use crate::{Config, ServiceError};

/// Protocol version this backend speaks.
pub const PROTO_VERSION: u32 = 1;

/// The four UEFI runtime services carried over the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    GetVariable = 1,
    SetVariable = 2,
    GetNextVariableName = 3,
    QueryVariableInfo = 4,
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::GetVariable),
            2 => Ok(Self::SetVariable),
            3 => Ok(Self::GetNextVariableName),
            4 => Ok(Self::QueryVariableInfo),
            other => Err(other),
        }
    }
}

/// One reply, rendered into the page after the request has been fully
/// consumed.
#[derive(Debug, Clone, Eq, PartialEq)]
enum Reply {
    Status(EfiStatus),
    /// `BUFFER_TOO_SMALL` with the size the guest should retry with.
    StatusSize(EfiStatus, u64),
    Data {
        attrs: u32,
        data: Vec<u8>,
    },
    NextName {
        name: VarName,
        guid: Guid,
    },
    QueryInfo {
        max_storage: u64,
        remaining: u64,
        max_var_size: u64,
    },
}

/// The variable service: store, policy configuration and the dispatcher.
#[derive(Debug)]
pub struct Service {
    config: Config,
    store: VarStore,
}

impl Service {
    pub fn new(config: Config, store: VarStore) -> Self {
        Service { config, store }
    }

    /// Rebuilds a service around a restored snapshot.
    pub fn from_snapshot(config: Config, blob: &[u8]) -> CodecResult<Service> {
        VarStore::restore(blob).map(|store| Service::new(config, store))
    }

    pub fn store(&self) -> &VarStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serializes the store for the durable backend.
    pub fn snapshot(&self) -> Vec<u8> {
        self.store.snapshot()
    }

    /// Handles one request in place.
    pub fn handle(&mut self, page: &mut [u8]) {
        let reply = self.dispatch(page);
        write_reply(page, &reply);
    }

    /// Runs a write through the full SetVariable path. The initial `*.auth`
    /// loads use this so they face exactly the checks a live guest write
    /// faces.
    pub fn set_variable(
        &mut self,
        name: &VarName,
        guid: &Guid,
        attrs: VarAttrs,
        data: &[u8],
    ) -> Result<(), ServiceError> {
        let plan = auth::evaluate_write(&self.config, &self.store, name, guid, attrs, data)?;
        self.apply(name, guid, plan)
    }

    fn dispatch(&mut self, page: &[u8]) -> Reply {
        let mut r = Reader::new(page);

        let version = match r.u32() {
            Ok(v) => v,
            Err(_) => return Reply::Status(EfiStatus::INVALID_PARAMETER),
        };
        if version != PROTO_VERSION {
            return Reply::Status(EfiStatus::UNSUPPORTED);
        }

        let command = match r.u32().map(Command::try_from) {
            Ok(Ok(command)) => command,
            Ok(Err(unknown)) => {
                debug!("unknown command {unknown}");
                return Reply::Status(EfiStatus::UNSUPPORTED);
            }
            Err(_) => return Reply::Status(EfiStatus::INVALID_PARAMETER),
        };

        let result = match command {
            Command::GetVariable => self.get_variable(&mut r),
            Command::SetVariable => self.set_variable_wire(&mut r),
            Command::GetNextVariableName => self.get_next_variable_name(&mut r),
            Command::QueryVariableInfo => self.query_variable_info(&mut r),
        };

        match result {
            Ok(reply) => reply,
            Err(ServiceError::BufferTooSmall(required)) => {
                Reply::StatusSize(EfiStatus::BUFFER_TOO_SMALL, required)
            }
            Err(err) => Reply::Status(err.status()),
        }
    }

    fn get_variable(&mut self, r: &mut Reader<'_>) -> Result<Reply, ServiceError> {
        let name = read_name(r)?;
        let guid = r.guid().map_err(|_| ServiceError::InvalidParameter)?;
        let _attrs_hint = r.u32().map_err(|_| ServiceError::InvalidParameter)?;
        let buffer_size = r.u64().map_err(|_| ServiceError::InvalidParameter)?;

        let var = self.store.get(&name, &guid).ok_or(ServiceError::NotFound)?;

        if (var.data.len() as u64) > buffer_size {
            return Err(ServiceError::BufferTooSmall(var.data.len() as u64));
        }

        Ok(Reply::Data {
            attrs: var.attrs.bits(),
            data: var.data.clone(),
        })
    }

    fn set_variable_wire(&mut self, r: &mut Reader<'_>) -> Result<Reply, ServiceError> {
        let name = read_name(r)?;
        let guid = r.guid().map_err(|_| ServiceError::InvalidParameter)?;
        let data = r
            .blob(SHMEM_SIZE)
            .map_err(|_| ServiceError::InvalidParameter)?
            .to_vec();
        let raw_attrs = r.u32().map_err(|_| ServiceError::InvalidParameter)?;

        let attrs =
            VarAttrs::validate(raw_attrs).map_err(|_| ServiceError::InvalidParameter)?;

        self.set_variable(&name, &guid, attrs, &data)?;
        Ok(Reply::Status(EfiStatus::SUCCESS))
    }

    fn get_next_variable_name(&mut self, r: &mut Reader<'_>) -> Result<Reply, ServiceError> {
        let buffer_size = r.u64().map_err(|_| ServiceError::InvalidParameter)?;
        let prev_raw = r
            .blob(MAX_VARIABLE_NAME_SIZE)
            .map_err(|_| ServiceError::InvalidParameter)?;
        let prev_guid = r.guid().map_err(|_| ServiceError::InvalidParameter)?;

        // An empty name (or a lone terminator) starts or restarts the pass.
        let prev = if prev_raw.is_empty() || prev_raw == [0, 0] {
            None
        } else {
            Some(VarName::from_utf16le(prev_raw).map_err(|_| ServiceError::InvalidParameter)?)
        };

        let next = match prev {
            None => self.store.next(None),
            Some(ref name) => self.store.next(Some((name, &prev_guid))),
        };

        match next {
            NextVar::Item(name, guid) => {
                let required = name.byte_len_with_nul() as u64;
                if required > buffer_size {
                    return Err(ServiceError::BufferTooSmall(required));
                }
                Ok(Reply::NextName { name, guid })
            }
            NextVar::End => Err(ServiceError::NotFound),
        }
    }

    fn query_variable_info(&mut self, r: &mut Reader<'_>) -> Result<Reply, ServiceError> {
        let raw_attrs = r.u32().map_err(|_| ServiceError::InvalidParameter)?;
        VarAttrs::validate(raw_attrs).map_err(|_| ServiceError::InvalidParameter)?;

        let max_storage =
            (MAX_VAR_COUNT * (MAX_VARIABLE_NAME_SIZE + MAX_VARIABLE_DATA_SIZE)) as u64;
        Ok(Reply::QueryInfo {
            max_storage,
            remaining: max_storage.saturating_sub(self.store.used_bytes()),
            max_var_size: MAX_VARIABLE_DATA_SIZE as u64,
        })
    }

    fn apply(
        &mut self,
        name: &VarName,
        guid: &Guid,
        plan: WritePlan,
    ) -> Result<(), ServiceError> {
        let result = match plan {
            WritePlan::Delete => self.store.remove(name, guid),
            WritePlan::Replace(var) => self.store.set(var),
            WritePlan::Append {
                data,
                timestamp,
                cert,
            } => self.store.append(name, guid, &data, timestamp, &cert),
            WritePlan::Noop => Ok(()),
        };

        result.map_err(|err| match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::OutOfResources => ServiceError::OutOfResources,
        })
    }
}

fn read_name(r: &mut Reader<'_>) -> Result<VarName, ServiceError> {
    let raw = r
        .blob(MAX_VARIABLE_NAME_SIZE)
        .map_err(|_| ServiceError::InvalidParameter)?;
    VarName::from_utf16le(raw).map_err(|_| ServiceError::InvalidParameter)
}

/// Renders a reply into the front of the page. A window too small for its
/// reply gets the longest prefix that fits; the writer cannot run past the
/// end.
fn write_reply(page: &mut [u8], reply: &Reply) {
    let mut w = Writer::new(page);
    let _ = try_write_reply(&mut w, reply);
}

fn try_write_reply(w: &mut Writer<'_>, reply: &Reply) -> CodecResult<()> {
    match reply {
        Reply::Status(status) => w.put_u64(status.as_u64()),
        Reply::StatusSize(status, size) => {
            w.put_u64(status.as_u64())?;
            w.put_u64(*size)
        }
        Reply::Data { attrs, data } => {
            w.put_u64(EfiStatus::SUCCESS.as_u64())?;
            w.put_u32(*attrs)?;
            w.put_blob(data)
        }
        Reply::NextName { name, guid } => {
            w.put_u64(EfiStatus::SUCCESS.as_u64())?;
            w.put_blob(&name.to_bytes_with_nul())?;
            w.put_guid(*guid)
        }
        Reply::QueryInfo {
            max_storage,
            remaining,
            max_var_size,
        } => {
            w.put_u64(EfiStatus::SUCCESS.as_u64())?;
            w.put_u64(*max_storage)?;
            w.put_u64(*remaining)?;
            w.put_u64(*max_var_size)
        }
    }
}
