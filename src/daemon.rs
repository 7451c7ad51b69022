//! The live-mode scheduler loop.
//!
//! Virtual time tracks the wall clock: before each wait the loop runs
//! every job due at the current wall offset, then arms the timerfd for
//! the next job and sleeps in epoll. Netlink traffic, control-socket
//! clients and RPC wakeups all enter through the same readiness
//! dispatch, so the scheduler thread suspends only here.

use std::{
    os::unix::io::AsRawFd,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use log::{info, warn};

use crate::{
    eloop::{EventFd, EventLoop, TimerFd},
    err::SockError,
    rpc::bridge::{Bridge, Envelope},
    sim::Wmediumd,
};

const TOKEN_NETLINK: u64 = 0;
const TOKEN_API_LISTEN: u64 = 1;
const TOKEN_TIMER: u64 = 2;
const TOKEN_RPC: u64 = 3;
const TOKEN_CLIENT_BASE: u64 = 16;

/// Run the simulator against the wall clock until a fatal loop error.
pub fn run(
    sim: &mut Wmediumd,
    api_path: Option<&Path>,
    bridge: Arc<Bridge>,
    bridge_rx: Receiver<Envelope>,
    wakeup: Arc<EventFd>,
) -> Result<(), SockError> {
    let eloop = EventLoop::new()?;
    let timer = TimerFd::new()?;
    eloop.register(timer.as_raw_fd(), TOKEN_TIMER)?;
    eloop.register(wakeup.as_raw_fd(), TOKEN_RPC)?;

    if let Some(fd) = sim.netlink_fd() {
        eloop.register(fd, TOKEN_NETLINK)?;
    }

    let listener = match api_path {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            eloop.register(listener.as_raw_fd(), TOKEN_API_LISTEN)?;
            info!("control socket listening on {}", path.display());
            Some(listener)
        }
        None => None,
    };

    let start = Instant::now();
    loop {
        let now_ns = start.elapsed().as_nanos() as u64;
        sim.run_due(now_ns);
        sim.advance_to(now_ns);

        match sim.next_due_ns() {
            Some(due) => timer.arm(Duration::from_nanos(due.saturating_sub(now_ns)))?,
            None => timer.arm(Duration::from_secs(3600))?,
        }

        for token in eloop.wait(None)? {
            match token {
                TOKEN_TIMER => timer.drain(),
                TOKEN_RPC => {
                    wakeup.drain();
                    for envelope in bridge_rx.try_iter() {
                        let reply = sim.handle_rpc(envelope.op);
                        bridge.complete(envelope.tag, reply);
                    }
                }
                TOKEN_NETLINK => sim.handle_netlink_readable(),
                TOKEN_API_LISTEN => {
                    if let Some(listener) = &listener {
                        match listener.accept() {
                            Ok((stream, _)) => {
                                let fd = stream.as_raw_fd();
                                let id = sim.add_api_client(stream);
                                eloop.register(fd, TOKEN_CLIENT_BASE + id as u64)?;
                            }
                            Err(e) => warn!("control socket accept failed: {e}"),
                        }
                    }
                }
                token if token >= TOKEN_CLIENT_BASE => {
                    let id = (token - TOKEN_CLIENT_BASE) as usize;
                    let fd = sim.client_fd(id);
                    if !sim.handle_api_readable(id) {
                        if let Some(fd) = fd {
                            eloop.unregister(fd);
                        }
                    }
                }
                other => warn!("readiness on unknown token {other}"),
            }
        }
    }
}
