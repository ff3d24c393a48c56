//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

/// User-space UEFI variable service backend for a Xen HVM guest.
#[derive(Debug, Parser)]
#[command(name = "xenvarsd")]
#[command(about = "UEFI variable service backend for Xen HVM guests")]
pub struct Cli {
    /// Domain id of the guest to serve.
    #[arg(long)]
    pub domain: u32,

    /// Tolerate a missing or corrupt durable blob and start empty.
    #[arg(long)]
    pub resume: bool,

    /// Drop privileges after the Xen resources are open.
    #[arg(long)]
    pub depriv: bool,

    /// Uid to switch to with --depriv.
    #[arg(long)]
    pub uid: Option<u32>,

    /// Gid to switch to with --depriv.
    #[arg(long)]
    pub gid: Option<u32>,

    /// Chroot directory applied before dropping uid/gid.
    #[arg(long)]
    pub chroot: Option<PathBuf>,

    /// File to write the daemon pid to.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Durable backend. Only "xapidb" is supported.
    #[arg(long, default_value = "xapidb")]
    pub backend: String,

    /// Backend argument as name:value (e.g. uuid:<vm-uuid>). Repeatable.
    #[arg(long = "arg", value_parser = parse_backend_arg)]
    pub args: Vec<(String, String)>,

    /// Directory holding the initial *.auth payloads for an empty store.
    #[arg(long, default_value = "/usr/share/xenvarsd")]
    pub auth_dir: PathBuf,

    /// Log at debug level.
    #[arg(long, short)]
    pub verbose: bool,
}

fn parse_backend_arg(raw: &str) -> Result<(String, String), String> {
    raw.split_once(':')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name:value, got {raw:?}"))
}
