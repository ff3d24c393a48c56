//! # xenvars-xapi
//!
//! The durable backend: the variable snapshot travels as base64 inside
//! XML-RPC calls to the XAPI database, with a local save file as the
//! crash/resume artifact of the same blob.
//!
//! The XML framing is a compatibility contract with the toolstack, not a
//! design choice; the strings built and matched here are reproduced
//! byte-for-byte. Only one backend exists per process, so the dispatch
//! point is a plain enum rather than a table of function pointers.

#![deny(unsafe_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use log::{info, warn};
use thiserror::Error;

use xenvars_core::codec::{base64_decode, base64_encode};

/// Default XML-RPC endpoint of the local toolstack.
pub const DEFAULT_XAPI_ADDRESS: &str = "127.0.0.1:80";

/// Default location of the local save file.
pub const DEFAULT_SAVE_PATH: &str = "/var/run/xenvarsd.save";

/// The NVRAM key the EFI variable blob lives under.
const NVRAM_KEY: &str = "EFI-variables";

/// Backend failure.
#[derive(Debug, Error)]
pub enum XapiError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed xml-rpc response")]
    MalformedResponse,
    #[error("xml-rpc fault from the toolstack")]
    Fault,
    #[error("corrupt variable blob: {0}")]
    CorruptBlob(xenvars_core::codec::CodecError),
    #[error("missing required argument {0:?}")]
    MissingArg(&'static str),
}

/// The active durable backend. One per process; `--backend` selects the
/// variant.
#[derive(Debug)]
pub enum Backend {
    Xapi(XapiDb),
}

impl Backend {
    /// Loads the initial blob. `Ok(None)` means "start with an empty
    /// store" and is only produced on the resume path.
    pub fn load(&mut self) -> Result<Option<Vec<u8>>, XapiError> {
        match self {
            Backend::Xapi(db) => db.load(),
        }
    }

    /// Persists a snapshot blob.
    pub fn save(&mut self, blob: &[u8]) -> Result<(), XapiError> {
        match self {
            Backend::Xapi(db) => db.save(blob),
        }
    }
}

/// The XAPI-database backend.
#[derive(Debug)]
pub struct XapiDb {
    address: String,
    /// VM uuid, from `--arg uuid:<uuid>`.
    vm_uuid: String,
    save_path: PathBuf,
    resume: bool,
    /// Session reference, filled by the first successful login.
    session: Option<String>,
}

impl XapiDb {
    /// Builds the backend from the `--arg k:v` pairs and flags.
    ///
    /// Recognized keys: `uuid` (required), `socket` (endpoint address,
    /// defaults to [`DEFAULT_XAPI_ADDRESS`]), `save` (save-file path,
    /// defaults to [`DEFAULT_SAVE_PATH`]).
    pub fn from_args(args: &[(String, String)], resume: bool) -> Result<XapiDb, XapiError> {
        let lookup = |key: &str| {
            args.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        Ok(XapiDb {
            address: lookup("socket").unwrap_or_else(|| DEFAULT_XAPI_ADDRESS.into()),
            vm_uuid: lookup("uuid").ok_or(XapiError::MissingArg("uuid"))?,
            save_path: lookup("save")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_PATH)),
            resume,
            session: None,
        })
    }

    /// Fetches the blob: from the local save file when resuming, from the
    /// toolstack otherwise.
    ///
    /// Without `--resume` any failure is fatal to the caller. With it, a
    /// missing or corrupt source degrades to an empty store.
    pub fn load(&mut self) -> Result<Option<Vec<u8>>, XapiError> {
        if self.resume {
            return match self.read_save_file() {
                Ok(blob) => {
                    info!("resumed {} bytes from {}", blob.len(), self.save_path.display());
                    Ok(Some(blob))
                }
                Err(err) => {
                    warn!("resume failed ({err}); starting with an empty store");
                    Ok(None)
                }
            };
        }

        let b64 = self.fetch_nvram()?;
        if b64.is_empty() {
            info!("no EFI variables in the XAPI database yet");
            return Ok(None);
        }
        let blob = base64_decode(&b64).map_err(XapiError::CorruptBlob)?;
        Ok(Some(blob))
    }

    /// Pushes the blob to the toolstack and mirrors it into the save file.
    /// The save file is written first so a toolstack outage cannot lose
    /// the snapshot.
    pub fn save(&mut self, blob: &[u8]) -> Result<(), XapiError> {
        let b64 = base64_encode(blob);

        if let Err(err) = fs::write(&self.save_path, &b64) {
            warn!("writing {} failed: {err}", self.save_path.display());
        }

        let session = self.session()?;
        let vm_ref = self.vm_ref(&session)?;
        let response = self.call(
            "VM.set_NVRAM_EFI_variables",
            &[&session, &vm_ref, &b64],
        )?;
        check_success(&response)?;
        info!("pushed {} bytes of EFI variables to the XAPI database", blob.len());
        Ok(())
    }

    fn read_save_file(&self) -> Result<Vec<u8>, XapiError> {
        let text = fs::read_to_string(&self.save_path)?;
        base64_decode(&text).map_err(XapiError::CorruptBlob)
    }

    fn fetch_nvram(&mut self) -> Result<String, XapiError> {
        let session = self.session()?;
        let vm_ref = self.vm_ref(&session)?;
        let response = self.call("VM.get_NVRAM", &[&session, &vm_ref])?;
        Ok(struct_member(&response, NVRAM_KEY).unwrap_or_default())
    }

    fn session(&mut self) -> Result<String, XapiError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let response = self.call("session.login_with_password", &["root", ""])?;
        let session = first_value(&response).ok_or(XapiError::MalformedResponse)?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn vm_ref(&mut self, session: &str) -> Result<String, XapiError> {
        let uuid = self.vm_uuid.clone();
        let response = self.call("VM.get_by_uuid", &[session, &uuid])?;
        first_value(&response).ok_or(XapiError::MalformedResponse)
    }

    /// One XML-RPC method call over a fresh HTTP/1.1 POST.
    fn call(&mut self, method: &str, params: &[&str]) -> Result<String, XapiError> {
        let body = method_call(method, params);
        let request = format!(
            "POST / HTTP/1.1\r\nHost: {}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.address,
            body.len(),
            body
        );

        let mut stream = TcpStream::connect(&self.address)?;
        stream.write_all(request.as_bytes())?;

        let mut raw = String::new();
        stream.read_to_string(&mut raw)?;

        // Strip the HTTP header block.
        let xml = raw
            .split_once("\r\n\r\n")
            .map(|(_, body)| body)
            .ok_or(XapiError::MalformedResponse)?;

        if xml.contains("<fault>") {
            return Err(XapiError::Fault);
        }
        Ok(xml.to_string())
    }
}

/// Serializes one method call. Byte-exact wire contract.
pub fn method_call(method: &str, params: &[&str]) -> String {
    let mut out = String::from("<?xml version='1.0'?><methodCall><methodName>");
    out.push_str(method);
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param><value><string>");
        out.push_str(param);
        out.push_str("</string></value></param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// First `<value>` string payload of a response. XAPI wraps results in a
/// `Status`/`Value` struct; the bare value comes after its `<name>`.
pub fn first_value(xml: &str) -> Option<String> {
    struct_member(xml, "Value").or_else(|| {
        extract_between(xml, "<value><string>", "</string></value>").map(str::to_string)
    })
}

/// The string value of a named struct member.
pub fn struct_member(xml: &str, name: &str) -> Option<String> {
    let needle = format!("<name>{name}</name>");
    let after = &xml[xml.find(&needle)? + needle.len()..];
    extract_between(after, "<value>", "</value>").map(|v| {
        // Values may or may not carry an inner <string> wrapper.
        v.strip_prefix("<string>")
            .and_then(|v| v.strip_suffix("</string>"))
            .unwrap_or(v)
            .to_string()
    })
}

/// A response whose `Status` member is not `Success` is a failure even
/// without a `<fault>` element.
fn check_success(xml: &str) -> Result<(), XapiError> {
    match struct_member(xml, "Status") {
        Some(status) if status == "Success" => Ok(()),
        Some(_) => Err(XapiError::Fault),
        // Plain responses without a status struct pass through.
        None => Ok(()),
    }
}

fn extract_between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}
