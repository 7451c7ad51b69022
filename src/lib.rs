//! # Wireless medium simulation for `mac80211_hwsim`
//!
//! ## Rationale
//!
//! The kernel's `mac80211_hwsim` driver hands every frame a simulated
//! radio transmits to user space over generic netlink and expects user
//! space to decide who hears it and how well. This crate is that user
//! space: an event-driven medium simulator with per-station 802.11
//! queues and CSMA/CA backoff, a configurable signal/path-loss/PER
//! model, and control surfaces for external tooling.
//!
//! ## The project is broken down into the following modules:
//! * `scheduler` - a deterministic virtual-time job scheduler that all
//!   simulation state changes run on.
//! * `eloop` - epoll-based readiness dispatch plus the timerfd that
//!   paces virtual time against the wall clock in live mode.
//! * `nl` - hand-rolled netlink wire handling: message framing,
//!   attribute encode/parse, the raw generic netlink socket and
//!   `CTRL_CMD_GETFAMILY` resolution.
//! * `hwsim` - the `mac80211_hwsim` family: commands, attributes,
//!   transmission flags and typed message records.
//! * `pmsr` - peer measurement (802.11mc FTM) request parsing and
//!   report synthesis.
//! * `ieee80211` - frame header inspection, access categories, rate
//!   sets and airtime arithmetic.
//! * `station` - simulated radios and the registry indexed by MAC.
//! * `medium` - path loss models, link SNR and the packet error table.
//! * `sim` - the engine tying it together: queues, backoff, the frame
//!   pipeline, clients and the link matrix.
//! * `api` - the stream protocol spoken on the control socket.
//! * `rpc` - the control server thread and its bridge into the
//!   scheduler loop.
//! * `config` - the declarative station/model configuration file.
//! * `pcap` - the packet capture sink.
//! * `err` - error types shared across the modules above.
//!
//! ## Design decisions
//!
//! The simulator core is strictly single threaded: every mutation of
//! stations, queues and frames happens inside a scheduler callback on
//! the loop thread. The only other thread is the RPC server, which
//! talks to the loop exclusively through a multi-producer channel plus
//! an eventfd wakeup; see [`rpc::bridge`] for the correlation scheme.
//!
//! Netlink serialization is infallible-by-construction where possible
//! and returns typed errors everywhere else; an unparseable message is
//! logged and dropped rather than tearing down the loop.

pub mod api;
pub mod config;
pub mod daemon;
pub mod eloop;
pub mod err;
pub mod hwsim;
pub mod ieee80211;
pub mod medium;
pub mod nl;
pub mod pcap;
pub mod pmsr;
pub mod rpc;
pub mod scheduler;
pub mod sim;
pub mod station;
