//! The typed RPC method surface.
//!
//! Validation happens here, before anything crosses to the loop:
//! malformed MAC addresses come back as `INVALID_ARGUMENT` without
//! waking the simulator, loop-side rejections as
//! `FAILED_PRECONDITION`. MAC addresses must be lowercase
//! colon-separated 17-character strings; anything else is rejected.

use std::{path::PathBuf, sync::Arc};

use crate::{
    err::RpcError,
    ieee80211::MacAddr,
    rpc::bridge::{Bridge, RpcOp, RpcReply},
    station::StationInfo,
};

/// The `WmediumdService` method set over the bridge.
pub struct WmediumdService {
    bridge: Arc<Bridge>,
}

fn parse_mac(s: &str) -> Result<MacAddr, RpcError> {
    s.parse()
        .map_err(|_| RpcError::invalid("got invalid mac address"))
}

impl WmediumdService {
    /// Wrap a bridge.
    pub fn new(bridge: Arc<Bridge>) -> Self {
        WmediumdService { bridge }
    }

    fn unit_call(&self, op: RpcOp) -> Result<(), RpcError> {
        match self.bridge.call(op) {
            RpcReply::Ok => Ok(()),
            RpcReply::Err(e) => Err(e),
            RpcReply::Stations(_) => Err(RpcError::precondition("unexpected reply kind")),
        }
    }

    /// Place a station.
    pub fn set_position(&self, mac: &str, x: f64, y: f64) -> Result<(), RpcError> {
        let mac = parse_mac(mac)?;
        self.unit_call(RpcOp::SetPosition { mac, x, y })
    }

    /// Pin a link SNR.
    pub fn set_snr(&self, mac1: &str, mac2: &str, snr: u8) -> Result<(), RpcError> {
        let mac1 = parse_mac(mac1)?;
        let mac2 = parse_mac(mac2)?;
        self.unit_call(RpcOp::SetSnr { mac1, mac2, snr })
    }

    /// Set transmit power.
    pub fn set_tx_power(&self, mac: &str, dbm: f64) -> Result<(), RpcError> {
        let mac = parse_mac(mac)?;
        self.unit_call(RpcOp::SetTxPower { mac, dbm })
    }

    /// Set LCI bytes.
    pub fn set_lci(&self, mac: &str, lci: Vec<u8>) -> Result<(), RpcError> {
        let mac = parse_mac(mac)?;
        self.unit_call(RpcOp::SetLci { mac, lci })
    }

    /// Set civic location bytes.
    pub fn set_civicloc(&self, mac: &str, civicloc: Vec<u8>) -> Result<(), RpcError> {
        let mac = parse_mac(mac)?;
        self.unit_call(RpcOp::SetCivicloc { mac, civicloc })
    }

    /// Load a configuration file.
    pub fn load_config(&self, path: &str) -> Result<(), RpcError> {
        if path.is_empty() {
            return Err(RpcError::invalid("empty configuration path"));
        }
        self.unit_call(RpcOp::LoadConfig {
            path: PathBuf::from(path),
        })
    }

    /// Reload the last configuration.
    pub fn reload_config(&self) -> Result<(), RpcError> {
        self.unit_call(RpcOp::ReloadConfig)
    }

    /// Start capturing to a pcap file.
    pub fn start_pcap(&self, path: &str) -> Result<(), RpcError> {
        if path.is_empty() {
            return Err(RpcError::invalid("empty pcap path"));
        }
        self.unit_call(RpcOp::StartPcap {
            path: PathBuf::from(path),
        })
    }

    /// Stop capturing.
    pub fn stop_pcap(&self) -> Result<(), RpcError> {
        self.unit_call(RpcOp::StopPcap)
    }

    /// List known stations.
    pub fn list_stations(&self) -> Result<Vec<StationInfo>, RpcError> {
        match self.bridge.call(RpcOp::ListStations) {
            RpcReply::Stations(stations) => Ok(stations),
            RpcReply::Err(e) => Err(e),
            RpcReply::Ok => Err(RpcError::precondition("unexpected reply kind")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{eloop::EventFd, err::RpcStatus};

    fn service() -> WmediumdService {
        let (bridge, _rx) = Bridge::new(Arc::new(EventFd::new().unwrap()));
        WmediumdService::new(bridge)
    }

    #[test]
    fn test_invalid_mac_rejected_without_touching_the_loop() {
        let service = service();
        // The bridge receiver is dropped, so reaching the loop would
        // come back UNAVAILABLE; validation must fire first.
        for bad in [
            "020000000000",
            "02:00:00:00:00",
            "02-00-00-00-00-00",
            "02:00:00:00:00:0G",
            "02:00:00:00:00:0A",
        ] {
            let err = service.set_position(bad, 0.0, 0.0).unwrap_err();
            assert_eq!(err.status(), RpcStatus::InvalidArgument, "{bad}");
        }
        let err = service
            .set_snr("02:00:00:00:00:00", "bogus", 10)
            .unwrap_err();
        assert_eq!(err.status(), RpcStatus::InvalidArgument);
    }

    #[test]
    fn test_valid_mac_reaches_the_dead_loop() {
        let service = service();
        let err = service.set_position("02:00:00:00:00:00", 1.0, 2.0).unwrap_err();
        assert_eq!(err.status(), RpcStatus::Unavailable);
    }
}
