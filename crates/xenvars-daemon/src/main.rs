//! `xenvarsd`: the user-space UEFI variable service for one Xen HVM guest.
//!
//! The guest firmware traps the variable runtime services and forwards
//! them through a single port-I/O write carrying a guest frame number;
//! this daemon maps the frame, executes the request against the
//! authenticated variable store, and persists the store to the XAPI
//! database on shutdown.

mod bootstrap;
mod cli;
mod logger;
mod pump;
mod signals;
mod xen;

use clap::Parser;
use log::{error, info};

use xenvars_core::Config;
use xenvars_xapi::{Backend, XapiDb};

use crate::bootstrap::SetupError;
use crate::cli::Cli;
use crate::pump::Pump;

fn main() {
    // Argument errors exit 1; the only exit used in production is
    // signal-driven.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    logger::init(cli.verbose);

    if cli.backend != "xapidb" {
        error!("unsupported backend {:?}", cli.backend);
        std::process::exit(1);
    }

    match run(cli) {
        Ok(sig) => {
            info!("shut down on signal {sig}");
            signals::reraise(sig);
        }
        Err(err) => {
            error!("did not enter the event loop: {err}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32, SetupError> {
    signals::install()?;

    // Policy flags the toolstack provides for the guest. Enforcing is the
    // default; `--arg auth-enforce:false` selects permissive.
    let flag = |key: &str, default: bool| {
        cli.args
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v == "true")
            .unwrap_or(default)
    };
    let config = Config {
        secure_boot_enabled: flag("secureboot", true),
        enforcing: flag("auth-enforce", true),
    };
    info!(
        "secure boot {}, authenticated writes {}",
        if config.secure_boot_enabled { "enabled" } else { "disabled" },
        if config.enforcing { "enforcing" } else { "permissive" },
    );

    let mut backend = Backend::Xapi(XapiDb::from_args(&cli.args, cli.resume)?);

    // Hypervisor resources come up before privileges go away.
    let bridge = xen::XenBridge::open(cli.domain as u16)?;

    if let Some(pidfile) = &cli.pidfile {
        bootstrap::write_pidfile(pidfile)?;
    }

    // Read enrollment files while the filesystem is still fully visible.
    let auth_payloads = bootstrap::read_auth_payloads(&cli.auth_dir)?;

    if cli.depriv {
        bootstrap::drop_privileges(cli.chroot.as_deref(), cli.gid, cli.uid)?;
    }

    let mut service = bootstrap::build_service(config, &mut backend)?;
    bootstrap::install_auth_payloads(&mut service, &auth_payloads)?;

    let mut pump = Pump::new(bridge, service);
    let sig = pump.run(signals::pending)?;

    info!("saving {} variable(s)", pump.service().store().count());
    bootstrap::save_store(pump.service(), &mut backend);

    Ok(sig)
}
