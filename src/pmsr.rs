//! Peer measurement (802.11mc fine timing measurement) support.
//!
//! `START_PMSR` carries an `nl80211` peer-measurement request nested
//! inside the hwsim attribute block; this module parses it into typed
//! records and synthesises the matching `REPORT_PMSR` result.
//!
//! Result synthesis is intentionally a stub with fixed fields: one
//! successful burst whose RTT comes from inter-station distance at the
//! speed of light, plus LCI/CIVIC bytes when requested and configured.
//! Peers with no matching station report failure.

use crate::{
    err::DeError,
    hwsim::{HwsimAttr, HwsimCmd, VERSION_NR},
    ieee80211::MacAddr,
    nl::{
        attr::{self, AttrIter},
        msg::MsgBuilder,
    },
};

// The nl80211 constants this module touches. Only defined in the
// kernel headers; carried here like the hwsim ones.
const NL80211_ATTR_MAC: u16 = 6;
const NL80211_ATTR_WIPHY_FREQ: u16 = 38;
const NL80211_ATTR_WIPHY_CHANNEL_TYPE: u16 = 39;
const NL80211_ATTR_CHANNEL_WIDTH: u16 = 159;
const NL80211_ATTR_CENTER_FREQ1: u16 = 160;
const NL80211_ATTR_CENTER_FREQ2: u16 = 161;
const NL80211_ATTR_MAC_MASK: u16 = 215;
const NL80211_ATTR_TIMEOUT: u16 = 264;
const NL80211_ATTR_PEER_MEASUREMENTS: u16 = 265;
const NL80211_ATTR_WIPHY_FREQ_OFFSET: u16 = 290;

const NL80211_PMSR_ATTR_PEERS: u16 = 5;

const NL80211_PMSR_PEER_ATTR_ADDR: u16 = 1;
const NL80211_PMSR_PEER_ATTR_CHAN: u16 = 2;
const NL80211_PMSR_PEER_ATTR_REQ: u16 = 3;
const NL80211_PMSR_PEER_ATTR_RESP: u16 = 4;

const NL80211_PMSR_REQ_ATTR_DATA: u16 = 1;
const NL80211_PMSR_REQ_ATTR_GET_AP_TSF: u16 = 2;

const NL80211_PMSR_RESP_ATTR_DATA: u16 = 1;
const NL80211_PMSR_RESP_ATTR_STATUS: u16 = 2;
const NL80211_PMSR_RESP_ATTR_HOST_TIME: u16 = 3;
const NL80211_PMSR_RESP_ATTR_FINAL: u16 = 5;

const NL80211_PMSR_TYPE_FTM: u16 = 1;

const NL80211_PMSR_FTM_REQ_ATTR_ASAP: u16 = 1;
const NL80211_PMSR_FTM_REQ_ATTR_PREAMBLE: u16 = 2;
const NL80211_PMSR_FTM_REQ_ATTR_NUM_BURSTS_EXP: u16 = 3;
const NL80211_PMSR_FTM_REQ_ATTR_BURST_PERIOD: u16 = 4;
const NL80211_PMSR_FTM_REQ_ATTR_BURST_DURATION: u16 = 5;
const NL80211_PMSR_FTM_REQ_ATTR_FTMS_PER_BURST: u16 = 6;
const NL80211_PMSR_FTM_REQ_ATTR_NUM_FTMR_RETRIES: u16 = 7;
const NL80211_PMSR_FTM_REQ_ATTR_REQUEST_LCI: u16 = 8;
const NL80211_PMSR_FTM_REQ_ATTR_REQUEST_CIVICLOC: u16 = 9;
const NL80211_PMSR_FTM_REQ_ATTR_TRIGGER_BASED: u16 = 10;
const NL80211_PMSR_FTM_REQ_ATTR_NON_TRIGGER_BASED: u16 = 11;
const NL80211_PMSR_FTM_REQ_ATTR_LMR_FEEDBACK: u16 = 12;
const NL80211_PMSR_FTM_REQ_ATTR_BSS_COLOR: u16 = 13;

const NL80211_PMSR_FTM_RESP_ATTR_BURST_INDEX: u16 = 2;
const NL80211_PMSR_FTM_RESP_ATTR_NUM_FTMR_ATTEMPTS: u16 = 3;
const NL80211_PMSR_FTM_RESP_ATTR_NUM_FTMR_SUCCESSES: u16 = 4;
const NL80211_PMSR_FTM_RESP_ATTR_RTT_AVG: u16 = 13;
const NL80211_PMSR_FTM_RESP_ATTR_RTT_VARIANCE: u16 = 14;
const NL80211_PMSR_FTM_RESP_ATTR_RTT_SPREAD: u16 = 15;
const NL80211_PMSR_FTM_RESP_ATTR_LCI: u16 = 19;
const NL80211_PMSR_FTM_RESP_ATTR_CIVICLOC: u16 = 20;

/// Measurement completed.
pub const PMSR_STATUS_SUCCESS: u32 = 0;
/// Measurement failed; peer unknown to the medium.
pub const PMSR_STATUS_FAILURE: u32 = 3;

/// Channel description inside a peer request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmsrChannel {
    /// Control channel frequency [MHz].
    pub center_freq: u32,
    /// Offset in kHz for S1G channels.
    pub freq_offset: u32,
    /// Legacy channel type.
    pub channel_type: u32,
    /// Channel width enum value.
    pub width: u32,
    /// First segment center frequency.
    pub center_freq1: u32,
    /// Second segment center frequency.
    pub center_freq2: u32,
}

/// FTM parameters of one peer request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FtmRequest {
    /// Requested preamble enum value.
    pub preamble: u32,
    /// Interval between bursts [units of 100 ms].
    pub burst_period: u32,
    /// Start measurement as soon as possible.
    pub asap: bool,
    /// log2 of the number of bursts.
    pub num_bursts_exp: u8,
    /// Burst duration exponent.
    pub burst_duration: u8,
    /// FTM frames per burst.
    pub ftms_per_burst: u8,
    /// FTM request retransmission limit.
    pub ftmr_retries: u8,
    /// Peer's LCI is requested.
    pub request_lci: bool,
    /// Peer's civic location is requested.
    pub request_civicloc: bool,
    /// Trigger-based ranging.
    pub trigger_based: bool,
    /// Non-trigger-based ranging.
    pub non_trigger_based: bool,
    /// LMR feedback requested.
    pub lmr_feedback: bool,
    /// BSS color of the responder.
    pub bss_color: u8,
}

/// One peer in a measurement request.
#[derive(Debug, Clone)]
pub struct PmsrPeer {
    /// Peer MAC address.
    pub addr: MacAddr,
    /// Channel to measure on.
    pub channel: PmsrChannel,
    /// Report the AP's TSF alongside.
    pub report_ap_tsf: bool,
    /// FTM parameters.
    pub ftm: FtmRequest,
}

/// A parsed `START_PMSR` request.
#[derive(Debug, Clone, Default)]
pub struct PmsrRequest {
    /// Overall timeout [ms].
    pub timeout: u32,
    /// Randomised source address, when given.
    pub mac_addr: Option<MacAddr>,
    /// Mask for the randomised address.
    pub mac_addr_mask: Option<MacAddr>,
    /// The peers to measure.
    pub peers: Vec<PmsrPeer>,
}

impl PmsrRequest {
    /// Parse the payload of [`HwsimAttr::PmsrRequest`].
    pub fn parse(payload: &[u8]) -> Result<Self, DeError> {
        let outer = AttrIter::new(payload);
        let measurements = outer
            .require(NL80211_ATTR_PEER_MEASUREMENTS, "NL80211_ATTR_PEER_MEASUREMENTS")?
            .nested();

        let mut request = PmsrRequest::default();
        for entry in measurements.clone() {
            let entry = entry?;
            match entry.ty {
                NL80211_ATTR_TIMEOUT => request.timeout = entry.get_u32()?,
                NL80211_ATTR_MAC => request.mac_addr = Some(entry.get_mac()?),
                NL80211_ATTR_MAC_MASK => request.mac_addr_mask = Some(entry.get_mac()?),
                NL80211_PMSR_ATTR_PEERS => request.peers.push(parse_peer(entry.nested())?),
                _ => {}
            }
        }
        Ok(request)
    }
}

fn parse_peer(peer: AttrIter) -> Result<PmsrPeer, DeError> {
    let addr = peer
        .require(NL80211_PMSR_PEER_ATTR_ADDR, "NL80211_PMSR_PEER_ATTR_ADDR")?
        .get_mac()?;

    let mut channel = PmsrChannel::default();
    if let Some(chan) = peer.find(NL80211_PMSR_PEER_ATTR_CHAN)? {
        for a in chan.nested() {
            let a = a?;
            match a.ty {
                NL80211_ATTR_WIPHY_FREQ => channel.center_freq = a.get_u32()?,
                NL80211_ATTR_WIPHY_FREQ_OFFSET => channel.freq_offset = a.get_u32()?,
                NL80211_ATTR_WIPHY_CHANNEL_TYPE => channel.channel_type = a.get_u32()?,
                NL80211_ATTR_CHANNEL_WIDTH => channel.width = a.get_u32()?,
                NL80211_ATTR_CENTER_FREQ1 => channel.center_freq1 = a.get_u32()?,
                NL80211_ATTR_CENTER_FREQ2 => channel.center_freq2 = a.get_u32()?,
                _ => {}
            }
        }
    }

    let req = peer
        .require(NL80211_PMSR_PEER_ATTR_REQ, "NL80211_PMSR_PEER_ATTR_REQ")?
        .nested();
    let report_ap_tsf = req.find(NL80211_PMSR_REQ_ATTR_GET_AP_TSF)?.is_some();
    let data = req
        .require(NL80211_PMSR_REQ_ATTR_DATA, "NL80211_PMSR_REQ_ATTR_DATA")?
        .nested();

    let mut ftm = FtmRequest::default();
    let mut have_ftm = false;
    for ty in data {
        let ty = ty?;
        if ty.ty == NL80211_PMSR_TYPE_FTM {
            ftm = parse_ftm(ty.nested())?;
            have_ftm = true;
        }
    }
    if !have_ftm {
        return Err(DeError::InvalidValue(
            "peer measurement without an FTM request".into(),
        ));
    }

    Ok(PmsrPeer {
        addr,
        channel,
        report_ap_tsf,
        ftm,
    })
}

fn parse_ftm(attrs: AttrIter) -> Result<FtmRequest, DeError> {
    let mut ftm = FtmRequest::default();
    for a in attrs {
        let a = a?;
        match a.ty {
            NL80211_PMSR_FTM_REQ_ATTR_ASAP => ftm.asap = true,
            NL80211_PMSR_FTM_REQ_ATTR_PREAMBLE => ftm.preamble = a.get_u32()?,
            NL80211_PMSR_FTM_REQ_ATTR_NUM_BURSTS_EXP => {
                ftm.num_bursts_exp = a.get_u32()? as u8
            }
            NL80211_PMSR_FTM_REQ_ATTR_BURST_PERIOD => ftm.burst_period = a.get_u32()?,
            NL80211_PMSR_FTM_REQ_ATTR_BURST_DURATION => {
                ftm.burst_duration = a.get_u32()? as u8
            }
            NL80211_PMSR_FTM_REQ_ATTR_FTMS_PER_BURST => {
                ftm.ftms_per_burst = a.get_u32()? as u8
            }
            NL80211_PMSR_FTM_REQ_ATTR_NUM_FTMR_RETRIES => {
                ftm.ftmr_retries = a.get_u32()? as u8
            }
            NL80211_PMSR_FTM_REQ_ATTR_REQUEST_LCI => ftm.request_lci = true,
            NL80211_PMSR_FTM_REQ_ATTR_REQUEST_CIVICLOC => ftm.request_civicloc = true,
            NL80211_PMSR_FTM_REQ_ATTR_TRIGGER_BASED => ftm.trigger_based = true,
            NL80211_PMSR_FTM_REQ_ATTR_NON_TRIGGER_BASED => ftm.non_trigger_based = true,
            NL80211_PMSR_FTM_REQ_ATTR_LMR_FEEDBACK => ftm.lmr_feedback = true,
            NL80211_PMSR_FTM_REQ_ATTR_BSS_COLOR => ftm.bss_color = a.get_u8()?,
            _ => {}
        }
    }
    Ok(ftm)
}

/// The synthesised result for one requested peer.
#[derive(Debug, Clone)]
pub struct PmsrResultPeer {
    /// Peer address the result is for.
    pub addr: MacAddr,
    /// [`PMSR_STATUS_SUCCESS`] or [`PMSR_STATUS_FAILURE`].
    pub status: u32,
    /// Average round-trip time [ps]; present on success.
    pub rtt_ps: Option<u64>,
    /// LCI bytes when requested and configured on the target.
    pub lci: Option<Vec<u8>>,
    /// Civic location bytes, as above.
    pub civicloc: Option<Vec<u8>>,
}

/// Encode a `REPORT_PMSR` message for `radio` with one final response
/// per peer.
pub fn build_report(
    family: u16,
    radio: MacAddr,
    host_time_ns: u64,
    peers: &[PmsrResultPeer],
) -> Vec<u8> {
    let mut builder = MsgBuilder::genl(
        family,
        libc::NLM_F_REQUEST as u16,
        HwsimCmd::ReportPmsr.into(),
        VERSION_NR,
    );
    let buf = builder.attrs();
    attr::put(buf, HwsimAttr::AddrTransmitter.into(), radio.as_bytes());

    let result = attr::begin_nested(buf, HwsimAttr::PmsrResult.into());
    for peer in peers {
        let entry = attr::begin_nested(buf, NL80211_PMSR_ATTR_PEERS);
        attr::put(buf, NL80211_PMSR_PEER_ATTR_ADDR, peer.addr.as_bytes());

        let resp = attr::begin_nested(buf, NL80211_PMSR_PEER_ATTR_RESP);
        attr::put_u32(buf, NL80211_PMSR_RESP_ATTR_STATUS, peer.status);
        attr::put_u64(buf, NL80211_PMSR_RESP_ATTR_HOST_TIME, host_time_ns);
        attr::put_flag(buf, NL80211_PMSR_RESP_ATTR_FINAL);

        if peer.status == PMSR_STATUS_SUCCESS {
            let data = attr::begin_nested(buf, NL80211_PMSR_RESP_ATTR_DATA);
            let ftm = attr::begin_nested(buf, NL80211_PMSR_TYPE_FTM);
            attr::put_u32(buf, NL80211_PMSR_FTM_RESP_ATTR_BURST_INDEX, 0);
            attr::put_u32(buf, NL80211_PMSR_FTM_RESP_ATTR_NUM_FTMR_ATTEMPTS, 1);
            attr::put_u32(buf, NL80211_PMSR_FTM_RESP_ATTR_NUM_FTMR_SUCCESSES, 1);
            attr::put_u64(
                buf,
                NL80211_PMSR_FTM_RESP_ATTR_RTT_AVG,
                peer.rtt_ps.unwrap_or(1),
            );
            attr::put_u64(buf, NL80211_PMSR_FTM_RESP_ATTR_RTT_VARIANCE, 0);
            attr::put_u64(buf, NL80211_PMSR_FTM_RESP_ATTR_RTT_SPREAD, 0);
            if let Some(lci) = &peer.lci {
                attr::put(buf, NL80211_PMSR_FTM_RESP_ATTR_LCI, lci);
            }
            if let Some(civic) = &peer.civicloc {
                attr::put(buf, NL80211_PMSR_FTM_RESP_ATTR_CIVICLOC, civic);
            }
            attr::end_nested(buf, ftm);
            attr::end_nested(buf, data);
        }

        attr::end_nested(buf, resp);
        attr::end_nested(buf, entry);
    }
    attr::end_nested(buf, result);

    builder.finish()
}

/// Encode a complete `START_PMSR` message the way the kernel sends
/// it; control-socket clients use this to exercise the measurement
/// path without a driver.
pub fn build_start_pmsr(family: u16, radio: MacAddr, request: &PmsrRequest) -> Vec<u8> {
    let mut builder = MsgBuilder::genl(
        family,
        libc::NLM_F_REQUEST as u16,
        HwsimCmd::StartPmsr.into(),
        VERSION_NR,
    );
    let buf = builder.attrs();
    attr::put(buf, HwsimAttr::AddrTransmitter.into(), radio.as_bytes());

    let req = attr::begin_nested(buf, HwsimAttr::PmsrRequest.into());
    let pm = attr::begin_nested(buf, NL80211_ATTR_PEER_MEASUREMENTS);
    if request.timeout != 0 {
        attr::put_u32(buf, NL80211_ATTR_TIMEOUT, request.timeout);
    }
    if let Some(mac) = request.mac_addr {
        attr::put(buf, NL80211_ATTR_MAC, mac.as_bytes());
    }
    if let Some(mask) = request.mac_addr_mask {
        attr::put(buf, NL80211_ATTR_MAC_MASK, mask.as_bytes());
    }
    for peer in &request.peers {
        let entry = attr::begin_nested(buf, NL80211_PMSR_ATTR_PEERS);
        attr::put(buf, NL80211_PMSR_PEER_ATTR_ADDR, peer.addr.as_bytes());

        let chan = attr::begin_nested(buf, NL80211_PMSR_PEER_ATTR_CHAN);
        attr::put_u32(buf, NL80211_ATTR_WIPHY_FREQ, peer.channel.center_freq);
        if peer.channel.width != 0 {
            attr::put_u32(buf, NL80211_ATTR_CHANNEL_WIDTH, peer.channel.width);
        }
        attr::end_nested(buf, chan);

        let req_attr = attr::begin_nested(buf, NL80211_PMSR_PEER_ATTR_REQ);
        if peer.report_ap_tsf {
            attr::put_flag(buf, NL80211_PMSR_REQ_ATTR_GET_AP_TSF);
        }
        let data = attr::begin_nested(buf, NL80211_PMSR_REQ_ATTR_DATA);
        let ftm = attr::begin_nested(buf, NL80211_PMSR_TYPE_FTM);
        if peer.ftm.asap {
            attr::put_flag(buf, NL80211_PMSR_FTM_REQ_ATTR_ASAP);
        }
        if peer.ftm.preamble != 0 {
            attr::put_u32(buf, NL80211_PMSR_FTM_REQ_ATTR_PREAMBLE, peer.ftm.preamble);
        }
        if peer.ftm.ftms_per_burst != 0 {
            attr::put_u32(
                buf,
                NL80211_PMSR_FTM_REQ_ATTR_FTMS_PER_BURST,
                u32::from(peer.ftm.ftms_per_burst),
            );
        }
        if peer.ftm.request_lci {
            attr::put_flag(buf, NL80211_PMSR_FTM_REQ_ATTR_REQUEST_LCI);
        }
        if peer.ftm.request_civicloc {
            attr::put_flag(buf, NL80211_PMSR_FTM_REQ_ATTR_REQUEST_CIVICLOC);
        }
        attr::end_nested(buf, ftm);
        attr::end_nested(buf, data);
        attr::end_nested(buf, req_attr);
        attr::end_nested(buf, entry);
    }
    attr::end_nested(buf, pm);
    attr::end_nested(buf, req);

    builder.finish()
}

/// Round-trip time for a distance at the speed of light [ps].
pub fn rtt_from_distance_ps(dist_m: f64) -> u64 {
    // 2 * d / c, c ~= 0.0003 m/ps.
    ((2.0 * dist_m / 0.000_299_792_458).round() as u64).max(1)
}
