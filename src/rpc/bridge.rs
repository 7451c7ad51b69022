//! Cross-thread bridge between RPC handlers and the scheduler loop.
//!
//! Request path: the handler enqueues an envelope on a multi-producer
//! channel and signals the eventfd the loop has registered; the loop
//! wakes, drains the queue inside a scheduler callback, applies the
//! mutation and completes the envelope's tag. Response path: the
//! handler blocks on its own single-use channel, so a response can
//! never reach the wrong waiter no matter how many RPCs are in flight.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::{
    eloop::EventFd,
    err::{RpcError, RpcStatus},
    ieee80211::MacAddr,
    station::StationInfo,
};

/// One state mutation or query applied on the loop thread.
#[derive(Debug, Clone)]
pub enum RpcOp {
    /// Place a station on the plane.
    SetPosition {
        /// Station MAC.
        mac: MacAddr,
        /// X [m].
        x: f64,
        /// Y [m].
        y: f64,
    },
    /// Pin the SNR between two stations.
    SetSnr {
        /// First endpoint.
        mac1: MacAddr,
        /// Second endpoint.
        mac2: MacAddr,
        /// SNR [dB].
        snr: u8,
    },
    /// Set a station's transmit power.
    SetTxPower {
        /// Station MAC.
        mac: MacAddr,
        /// Power [dBm].
        dbm: f64,
    },
    /// Set a station's LCI bytes.
    SetLci {
        /// Station MAC.
        mac: MacAddr,
        /// LCI payload.
        lci: Vec<u8>,
    },
    /// Set a station's civic location bytes.
    SetCivicloc {
        /// Station MAC.
        mac: MacAddr,
        /// Civic location payload.
        civicloc: Vec<u8>,
    },
    /// Load a configuration file.
    LoadConfig {
        /// Path to load.
        path: PathBuf,
    },
    /// Reload the last loaded configuration.
    ReloadConfig,
    /// Open a capture file.
    StartPcap {
        /// Path to write.
        path: PathBuf,
    },
    /// Close the capture file.
    StopPcap,
    /// List known stations.
    ListStations,
}

/// Loop-side result of one [`RpcOp`].
#[derive(Debug, Clone)]
pub enum RpcReply {
    /// Operation applied.
    Ok,
    /// Station listing.
    Stations(Vec<StationInfo>),
    /// Loop-side rejection.
    Err(RpcError),
}

/// A tagged request crossing to the loop thread.
pub struct Envelope {
    /// Correlation tag; unique per in-flight request.
    pub tag: u64,
    /// The operation to apply.
    pub op: RpcOp,
}

/// The handler-side half of the bridge.
pub struct Bridge {
    tx: Sender<Envelope>,
    wakeup: Arc<EventFd>,
    next_tag: AtomicU64,
    waiters: Mutex<HashMap<u64, Sender<RpcReply>>>,
}

impl Bridge {
    /// Create the bridge around an eventfd the loop registers. The
    /// returned receiver belongs to the loop thread.
    pub fn new(wakeup: Arc<EventFd>) -> (Arc<Bridge>, Receiver<Envelope>) {
        let (tx, rx) = unbounded();
        (
            Arc::new(Bridge {
                tx,
                wakeup,
                next_tag: AtomicU64::new(1),
                waiters: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }

    /// Apply `op` on the loop thread and wait for its reply.
    pub fn call(&self, op: RpcOp) -> RpcReply {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = bounded(1);
        self.waiters.lock().insert(tag, reply_tx);

        if self.tx.send(Envelope { tag, op }).is_err() {
            self.waiters.lock().remove(&tag);
            return RpcReply::Err(RpcError::new(
                RpcStatus::Unavailable,
                "simulator loop is gone",
            ));
        }
        self.wakeup.signal();

        match reply_rx.recv() {
            Ok(reply) => reply,
            Err(_) => RpcReply::Err(RpcError::new(
                RpcStatus::Unavailable,
                "simulator loop dropped the request",
            )),
        }
    }

    /// Deliver the loop's reply for `tag`. Called from the scheduler
    /// loop after applying the envelope.
    pub fn complete(&self, tag: u64, reply: RpcReply) {
        if let Some(waiter) = self.waiters.lock().remove(&tag) {
            // A handler that timed out and went away is not an error.
            let _ = waiter.send(reply);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn bridge() -> (Arc<Bridge>, Receiver<Envelope>) {
        Bridge::new(Arc::new(EventFd::new().unwrap()))
    }

    #[test]
    fn test_call_completes_with_matching_tag() {
        let (bridge, rx) = bridge();
        let loop_side = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                let envelope = rx.recv().unwrap();
                assert!(matches!(envelope.op, RpcOp::StopPcap));
                bridge.complete(envelope.tag, RpcReply::Ok);
            })
        };
        assert!(matches!(bridge.call(RpcOp::StopPcap), RpcReply::Ok));
        loop_side.join().unwrap();
    }

    #[test]
    fn test_concurrent_calls_never_cross_replies() {
        let (bridge, rx) = bridge();
        // Echo each request's x coordinate back through the error
        // message so the caller can check it got its own reply.
        let loop_side = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                for _ in 0..64 {
                    let envelope = rx.recv().unwrap();
                    let RpcOp::SetPosition { x, .. } = envelope.op else {
                        panic!("unexpected op");
                    };
                    bridge.complete(
                        envelope.tag,
                        RpcReply::Err(RpcError::precondition(format!("{x}"))),
                    );
                }
            })
        };

        let mut callers = Vec::new();
        for i in 0..64 {
            let bridge = Arc::clone(&bridge);
            callers.push(thread::spawn(move || {
                let mac: MacAddr = "02:00:00:00:00:00".parse().unwrap();
                let reply = bridge.call(RpcOp::SetPosition {
                    mac,
                    x: f64::from(i),
                    y: 0.0,
                });
                let RpcReply::Err(e) = reply else {
                    panic!("expected the echoed error");
                };
                assert_eq!(e.message(), format!("{i}"));
            }));
        }
        for caller in callers {
            caller.join().unwrap();
        }
        loop_side.join().unwrap();
    }

    #[test]
    fn test_dead_loop_reports_unavailable() {
        let (bridge, rx) = bridge();
        drop(rx);
        let RpcReply::Err(e) = bridge.call(RpcOp::ReloadConfig) else {
            panic!("expected an error");
        };
        assert_eq!(e.status(), RpcStatus::Unavailable);
    }
}
