//! The `wmediumd` binary: flag parsing, transport setup, thread
//! spawn, and the fatal-error exit path. Everything interesting lives
//! in the library.

use std::{path::PathBuf, sync::Arc, thread};

use anyhow::Context;
use clap::Parser;
use log::info;

use wmediumd::{
    config::Config,
    daemon,
    eloop::EventFd,
    hwsim::{FAMILY_NAME, MCAST_GROUP_CONFIG},
    nl::{ctrl, sock::NlSock},
    rpc::{bridge::Bridge, server, service::WmediumdService},
    sim::Wmediumd,
};

/// Wireless medium simulator for the mac80211_hwsim kernel driver.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file; may also be loaded later over RPC.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket path for API clients.
    #[arg(long)]
    api: Option<PathBuf>,

    /// UNIX socket path for the RPC server; enables it.
    #[arg(long = "grpc-uds-path", alias = "grpc_uds_path")]
    grpc_uds_path: Option<PathBuf>,

    /// Start capturing to this pcap file immediately.
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Log filter, e.g. `info` or `wmediumd=trace`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Fixed RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Skip the kernel netlink attach; only API/RPC clients drive the
    /// medium. Intended for development against the control surfaces.
    #[arg(long)]
    no_netlink: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();

    let mut sim = Wmediumd::new(Config::empty(), args.seed);
    if let Some(path) = &args.config {
        sim.load_config_path(path.clone())
            .with_context(|| format!("loading configuration {}", path.display()))?;
    }

    if !args.no_netlink {
        let nl = NlSock::connect().context("opening the generic netlink socket")?;
        let family = ctrl::resolve_family(&nl, FAMILY_NAME)
            .context("resolving the hwsim netlink family")?;
        if let Some(group) = family.mcast_group(MCAST_GROUP_CONFIG) {
            nl.add_membership(group)
                .context("joining the hwsim config multicast group")?;
        }
        sim.attach_netlink(nl, family);
        sim.register_with_driver()
            .context("registering as the medium")?;
        info!("attached to {FAMILY_NAME}");
    }

    if let Some(path) = &args.pcap {
        if let wmediumd::rpc::bridge::RpcReply::Err(e) =
            sim.handle_rpc(wmediumd::rpc::bridge::RpcOp::StartPcap { path: path.clone() })
        {
            anyhow::bail!("starting pcap capture: {e}");
        }
    }

    let wakeup = Arc::new(EventFd::new().context("creating the rpc wakeup eventfd")?);
    let (bridge, bridge_rx) = Bridge::new(Arc::clone(&wakeup));

    if let Some(path) = &args.grpc_uds_path {
        let listener = server::bind(path).context("binding the rpc server socket")?;
        let service = Arc::new(WmediumdService::new(Arc::clone(&bridge)));
        thread::spawn(move || server::serve(listener, service));
    }

    daemon::run(
        &mut sim,
        args.api.as_deref(),
        bridge,
        bridge_rx,
        wakeup,
    )
    .context("simulator loop failed")?;
    Ok(())
}
