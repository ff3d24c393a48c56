//! Process bootstrap: restore-or-empty store construction, initial key
//! enrollment from `*.auth` files, pidfile and privilege dropping.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::{error, info};
use thiserror::Error;

use xenvars_core::codec::CodecError;
use xenvars_core::{Config, Service, ServiceError, VarStore};
use xenvars_efi::guid::{EFI_GLOBAL_VARIABLE, EFI_IMAGE_SECURITY_DATABASE};
use xenvars_efi::{Guid, VarAttrs, VarName};
use xenvars_xapi::{Backend, XapiError};

/// Bootstrap failure; all of these are fatal before the loop starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("durable backend: {0}")]
    Backend(#[from] XapiError),
    #[error("corrupt durable blob: {0}")]
    CorruptBlob(CodecError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("initial {name} enrollment rejected: {err:?}")]
    AuthLoad { name: String, err: ServiceError },
}

/// Builds the service from the durable blob, or empty when the backend
/// reports nothing (resume path).
pub fn build_service(config: Config, backend: &mut Backend) -> Result<Service, SetupError> {
    match backend.load()? {
        Some(blob) => {
            let service =
                Service::from_snapshot(config, &blob).map_err(SetupError::CorruptBlob)?;
            info!("restored {} variable(s)", service.store().count());
            Ok(service)
        }
        None => Ok(Service::new(config, VarStore::new())),
    }
}

/// One initial authenticated payload, read before privileges drop and
/// installed after the store exists.
#[derive(Debug)]
pub struct AuthPayload {
    pub name: &'static str,
    pub guid: Guid,
    pub data: Vec<u8>,
}

/// The well-known enrollment files, in hierarchy order: PK first so the
/// remaining installs run against the fresh platform key.
const AUTH_FILES: [(&str, &str, Guid); 4] = [
    ("PK.auth", "PK", EFI_GLOBAL_VARIABLE),
    ("KEK.auth", "KEK", EFI_GLOBAL_VARIABLE),
    ("db.auth", "db", EFI_IMAGE_SECURITY_DATABASE),
    ("dbx.auth", "dbx", EFI_IMAGE_SECURITY_DATABASE),
];

/// Reads whichever `*.auth` files exist under `dir`.
pub fn read_auth_payloads(dir: &Path) -> io::Result<Vec<AuthPayload>> {
    let mut payloads = Vec::new();
    for (file, name, guid) in AUTH_FILES {
        let path = dir.join(file);
        match fs::read(&path) {
            Ok(data) => {
                info!("loaded {} ({} bytes)", path.display(), data.len());
                payloads.push(AuthPayload { name, guid, data });
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(payloads)
}

/// Enrolls the initial payloads through the live SetVariable path. Only an
/// empty store is seeded; a populated one keeps what it restored.
pub fn install_auth_payloads(
    service: &mut Service,
    payloads: &[AuthPayload],
) -> Result<(), SetupError> {
    if service.store().count() != 0 {
        info!("store already populated, skipping initial enrollment");
        return Ok(());
    }

    for payload in payloads {
        let name = VarName::from_str(payload.name).map_err(|_| SetupError::AuthLoad {
            name: payload.name.to_string(),
            err: ServiceError::InvalidParameter,
        })?;
        service
            .set_variable(&name, &payload.guid, VarAttrs::POLICY, &payload.data)
            .map_err(|err| SetupError::AuthLoad {
                name: payload.name.to_string(),
                err,
            })?;
        info!("enrolled {}", payload.name);
    }
    Ok(())
}

/// Pushes the snapshot through the backend. Failures are logged, not
/// propagated: shutdown continues regardless.
pub fn save_store(service: &Service, backend: &mut Backend) {
    if let Err(err) = backend.save(&service.snapshot()) {
        error!("saving the variable snapshot failed: {err}");
    }
}

pub fn write_pidfile(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Applies `--chroot`, `--gid`, `--uid`, in that order.
pub fn drop_privileges(
    chroot: Option<&Path>,
    gid: Option<u32>,
    uid: Option<u32>,
) -> io::Result<()> {
    if let Some(dir) = chroot {
        let c_dir = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in chroot path"))?;
        if unsafe { libc::chroot(c_dir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        info!("chrooted to {}", dir.display());
    }

    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        info!("running as uid {uid}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenvars_efi::guid::EFI_CERT_X509;
    use xenvars_efi::signature::SignatureList;
    use xenvars_efi::EfiTime;
    use xenvars_xapi::XapiDb;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("xenvarsd-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// A minimal, well-formed authenticated PK payload: descriptor plus a
    /// one-certificate signature list. Setup mode skips the signature
    /// itself.
    fn pk_auth_bytes() -> Vec<u8> {
        let ts = EfiTime {
            year: 2024,
            month: 1,
            day: 1,
            ..EfiTime::default()
        };
        let payload = SignatureList::single(EFI_CERT_X509, Guid::default(), b"cert der");

        let mut out = Vec::new();
        out.extend_from_slice(&ts.to_bytes());
        out.extend_from_slice(&(24u32 + 4).to_le_bytes());
        out.extend_from_slice(&0x0200u16.to_le_bytes());
        out.extend_from_slice(&0x0ef1u16.to_le_bytes());
        out.extend_from_slice(&xenvars_efi::guid::EFI_CERT_TYPE_PKCS7.to_bytes());
        out.extend_from_slice(b"stub");
        out.extend_from_slice(&payload);
        out
    }

    fn empty_service() -> Service {
        Service::new(Config::default(), VarStore::new())
    }

    #[test]
    fn reads_only_present_files() {
        let dir = temp_dir("auth-partial");
        fs::write(dir.join("PK.auth"), pk_auth_bytes()).unwrap();

        let payloads = read_auth_payloads(&dir).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].name, "PK");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_dir_is_empty() {
        let payloads = read_auth_payloads(Path::new("/nonexistent/certainly")).unwrap();
        assert!(payloads.is_empty());
    }

    #[test]
    fn enrollment_installs_pk() {
        let mut service = empty_service();
        let payloads = vec![AuthPayload {
            name: "PK",
            guid: EFI_GLOBAL_VARIABLE,
            data: pk_auth_bytes(),
        }];

        install_auth_payloads(&mut service, &payloads).unwrap();
        let pk = VarName::from_str("PK").unwrap();
        let var = service.store().get(&pk, &EFI_GLOBAL_VARIABLE).unwrap();
        assert_eq!(var.attrs, VarAttrs::POLICY);
    }

    #[test]
    fn enrollment_skips_populated_store() {
        let mut service = empty_service();
        let lang = VarName::from_str("Lang").unwrap();
        service
            .set_variable(
                &lang,
                &EFI_GLOBAL_VARIABLE,
                VarAttrs::NON_VOLATILE
                    | VarAttrs::BOOTSERVICE_ACCESS
                    | VarAttrs::RUNTIME_ACCESS,
                b"en",
            )
            .unwrap();

        let payloads = vec![AuthPayload {
            name: "PK",
            guid: EFI_GLOBAL_VARIABLE,
            data: pk_auth_bytes(),
        }];
        install_auth_payloads(&mut service, &payloads).unwrap();

        let pk = VarName::from_str("PK").unwrap();
        assert!(service.store().get(&pk, &EFI_GLOBAL_VARIABLE).is_none());
    }

    #[test]
    fn malformed_enrollment_is_fatal() {
        let mut service = empty_service();
        let payloads = vec![AuthPayload {
            name: "PK",
            guid: EFI_GLOBAL_VARIABLE,
            data: b"definitely not an authentication descriptor".to_vec(),
        }];
        let err = install_auth_payloads(&mut service, &payloads).unwrap_err();
        assert!(matches!(err, SetupError::AuthLoad { .. }));
    }

    #[test]
    fn build_service_round_trips_through_backend() {
        let dir = temp_dir("backend");
        let save = dir.join("save.b64");

        // Seed a snapshot through the backend's save path.
        let mut service = empty_service();
        let lang = VarName::from_str("Lang").unwrap();
        service
            .set_variable(
                &lang,
                &EFI_GLOBAL_VARIABLE,
                VarAttrs::NON_VOLATILE
                    | VarAttrs::BOOTSERVICE_ACCESS
                    | VarAttrs::RUNTIME_ACCESS,
                b"en",
            )
            .unwrap();
        fs::write(&save, xenvars_core::codec::base64_encode(&service.snapshot())).unwrap();

        let args = vec![
            ("uuid".to_string(), "u".to_string()),
            ("save".to_string(), save.to_str().unwrap().to_string()),
        ];
        let mut backend = Backend::Xapi(XapiDb::from_args(&args, true).unwrap());
        let restored = build_service(Config::default(), &mut backend).unwrap();
        assert_eq!(restored.store().count(), 1);
        assert!(restored.store().get(&lang, &EFI_GLOBAL_VARIABLE).is_some());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn pidfile_contains_pid() {
        let dir = temp_dir("pid");
        let path = dir.join("xenvarsd.pid");
        write_pidfile(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim().parse::<u32>().unwrap(), std::process::id());
        let _ = fs::remove_dir_all(&dir);
    }
}
