use anyhow::{Result, bail};
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::info;

mod cli;
mod cmds;
mod dhcp;
mod dispatch;
mod dut;
mod host;
mod logging;
mod netcfg;
mod proto;
mod server;
mod wfd;
mod wpa;

#[cfg(test)]
mod testutil;

use dut::{Dut, DutEnv};
use host::LinuxHost;
use wfd::{HelperWfd, NoWfd, WfdExtension};
use wpa::ctrl::SocketCtrl;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(
        logging::level_for(args.debug, args.quiet),
        !args.no_timestamps,
    );

    if args.print_version {
        println!(
            "sigma_dut {}{}",
            env!("CARGO_PKG_VERSION"),
            args.version_suffix.as_deref().unwrap_or_default()
        );
        return Ok(());
    }

    if let Some(cmd) = &args.local_cmd {
        return server::run_local_cmd(args.port, cmd);
    }

    let summary = args
        .summary_log
        .as_deref()
        .map(logging::SummaryLog::open)
        .transpose()?;

    let host: Arc<dyn host::Host> = Arc::new(LinuxHost);
    let wfd: Arc<dyn WfdExtension> = match &args.wfd_helper {
        Some(p) => Arc::new(HelperWfd::new(p.clone(), host.clone())),
        None => Arc::new(NoWfd),
    };
    let env = DutEnv::new(
        args.dut_config(),
        Arc::new(SocketCtrl::new(args.ctrl_dir.clone())),
        host,
        wfd,
    );
    info!(
        "sigma_dut {} starting (driver {:?})",
        env!("CARGO_PKG_VERSION"),
        env.driver()
    );

    let table = cmds::build_table();
    let mut server = server::Server::bind(("0.0.0.0", args.port))?;

    if args.daemonize {
        // SAFETY: no other threads exist yet.
        if unsafe { libc::daemon(0, 0) } != 0 {
            bail!("daemon: {}", std::io::Error::last_os_error());
        }
    }

    let dhcp = args.internal_dhcp.then(|| dhcp::spawn_monitor(env.clone()));
    let mut dut = Dut::new(env);

    server::install_signal_handlers();
    let stop = AtomicBool::new(false);
    let res = server.run(&mut dut, &table, summary.as_ref(), &stop);

    if let Some(h) = dhcp {
        let _ = h.join();
    }
    res
}
