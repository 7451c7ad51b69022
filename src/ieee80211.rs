//! 802.11 frame inspection and air arithmetic.
//!
//! Covers exactly what the medium needs to know about a frame: the
//! frame-control type bits, the receiver address, the QoS TID for
//! access-category selection, the legacy rate sets per band, and the
//! time a transmission occupies the air.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::err::DeError;

/// Length of a MAC address in bytes.
pub const ETH_ALEN: usize = 6;

/// Number of 802.11 access categories.
pub const NUM_ACS: usize = 4;

/// Maximum entries in a frame's rate retry schedule.
pub const TX_MAX_RATES: usize = 4;

/// Thermal noise floor assumed by the medium [dBm].
pub const NOISE_LEVEL: i32 = -91;

/// Clear channel assessment threshold [dBm].
pub const CCA_THRESHOLD: i32 = -90;

/// A six-byte IEEE 802 hardware address.
///
/// The canonical textual form is lowercase colon-separated
/// (`02:00:00:00:00:00`); parsing rejects anything that is not exactly
/// that shape, matching the validation the RPC surface promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; ETH_ALEN]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xff; ETH_ALEN]);

    /// True for group-addressed (multicast or broadcast) destinations.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Read an address from the start of a buffer.
    pub fn from_slice(buf: &[u8]) -> Result<Self, DeError> {
        if buf.len() < ETH_ALEN {
            return Err(DeError::UnexpectedEob("MAC address"));
        }
        let mut addr = [0u8; ETH_ALEN];
        addr.copy_from_slice(&buf[..ETH_ALEN]);
        Ok(MacAddr(addr))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; ETH_ALEN] {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = DeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DeError::InvalidValue(format!("bad MAC address {s:?}"));
        // Exactly the canonical lowercase form, nothing looser.
        if s.len() != 17 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(bad());
        }
        let mut addr = [0u8; ETH_ALEN];
        for (i, octet) in s.split(':').enumerate() {
            if i >= ETH_ALEN || octet.len() != 2 {
                return Err(bad());
            }
            addr[i] = u8::from_str_radix(octet, 16).map_err(|_| bad())?;
        }
        Ok(MacAddr(addr))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The four EDCA access categories, from highest to lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ac {
    /// Voice.
    Vo = 0,
    /// Video.
    Vi = 1,
    /// Best effort.
    Be = 2,
    /// Background.
    Bk = 3,
}

/// 802.1d priority to access category, per IEEE 802.11-2016 table 10-1.
const IEEE802_1D_TO_AC: [Ac; 8] = [
    Ac::Be,
    Ac::Bk,
    Ac::Bk,
    Ac::Be,
    Ac::Vi,
    Ac::Vi,
    Ac::Vo,
    Ac::Vo,
];

const FCTL_FTYPE: u16 = 0x000c;
const FCTL_STYPE: u16 = 0x00f0;
const FCTL_TODS: u16 = 0x0100;
const FCTL_FROMDS: u16 = 0x0200;

const FTYPE_DATA: u16 = 0x0008;
const STYPE_QOS_DATA: u16 = 0x0080;

const QOS_CTL_TID_MASK: u8 = 0x0f;

/// A borrowed view over raw 802.11 frame bytes.
///
/// Only headers the simulator actually consults are decoded; anything
/// short or exotic falls back to safe defaults rather than erroring,
/// since the bytes come straight from the driver.
pub struct FrameView<'a>(&'a [u8]);

impl<'a> FrameView<'a> {
    /// Wrap a frame buffer.
    pub fn new(data: &'a [u8]) -> Self {
        FrameView(data)
    }

    fn frame_control(&self) -> u16 {
        if self.0.len() < 2 {
            return 0;
        }
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    /// True for data-type frames.
    pub fn is_data(&self) -> bool {
        self.frame_control() & FCTL_FTYPE == FTYPE_DATA
    }

    /// True for QoS data subtypes.
    pub fn is_qos_data(&self) -> bool {
        self.frame_control() & (FCTL_FTYPE | STYPE_QOS_DATA) == (FTYPE_DATA | STYPE_QOS_DATA)
    }

    /// The receiver address (addr1).
    pub fn dest(&self) -> Option<MacAddr> {
        MacAddr::from_slice(self.0.get(4..4 + ETH_ALEN)?).ok()
    }

    /// The QoS control TID, if the frame carries a QoS header.
    fn tid(&self) -> Option<u8> {
        if !self.is_qos_data() {
            return None;
        }
        // QoS control follows the three or four address fields.
        let fc = self.frame_control();
        let offset = if fc & (FCTL_TODS | FCTL_FROMDS) == (FCTL_TODS | FCTL_FROMDS) {
            30
        } else {
            24
        };
        Some(self.0.get(offset)? & QOS_CTL_TID_MASK)
    }

    /// Select the access category the way the driver's queue mapping
    /// does: management traffic goes out as voice, non-QoS data as
    /// best effort, QoS data per its TID.
    pub fn select_queue(&self) -> Ac {
        if !self.is_data() {
            return Ac::Vo;
        }
        match self.tid() {
            Some(tid) => IEEE802_1D_TO_AC[usize::from(tid & 0x07)],
            None => Ac::Be,
        }
    }
}

/// Legacy rate table in units of 100 kb/s; 2.4 GHz uses all twelve
/// entries, 5 GHz skips the four CCK rates.
const RATES_100KBPS: [u32; 12] = [10, 20, 55, 110, 60, 90, 120, 180, 240, 360, 480, 540];

const CCK_RATE_COUNT: usize = 4;

/// True when the frequency belongs to the 5 GHz band.
pub fn is_5ghz(freq_mhz: u32) -> bool {
    freq_mhz > 5000
}

/// Number of valid rate indexes for a band.
pub fn rate_count(freq_mhz: u32) -> usize {
    if is_5ghz(freq_mhz) {
        RATES_100KBPS.len() - CCK_RATE_COUNT
    } else {
        RATES_100KBPS.len()
    }
}

/// Map a driver rate index to a bitrate in 100 kb/s units, clamping
/// out-of-range indexes to the top rate of the band.
pub fn index_to_rate(index: usize, freq_mhz: u32) -> u32 {
    let index = if is_5ghz(freq_mhz) {
        index + CCK_RATE_COUNT
    } else {
        index
    };
    RATES_100KBPS[index.min(RATES_100KBPS.len() - 1)]
}

/// Per-band interframe timing [µs].
#[derive(Debug, Clone, Copy)]
pub struct BandTiming {
    /// Short interframe space.
    pub sifs: u64,
    /// Slot time.
    pub slot: u64,
}

/// Timing parameters for the band a frequency falls in.
pub fn band_timing(freq_mhz: u32) -> BandTiming {
    if is_5ghz(freq_mhz) {
        BandTiming { sifs: 16, slot: 9 }
    } else {
        BandTiming { sifs: 10, slot: 9 }
    }
}

/// Arbitration interframe space for an AIFSN value [µs].
pub fn aifs(timing: BandTiming, aifsn: u64) -> u64 {
    timing.sifs + aifsn * timing.slot
}

/// PLCP preamble plus header overhead for a rate [µs]. CCK rates pay
/// the long DSSS preamble; OFDM rates the 20 µs preamble and signal
/// field.
fn plcp_overhead(rate_idx: usize, freq_mhz: u32) -> u64 {
    if !is_5ghz(freq_mhz) && rate_idx < CCK_RATE_COUNT {
        192
    } else {
        20
    }
}

/// Time a payload of `len` bytes occupies the air at a rate [µs].
pub fn pkt_duration_us(len: usize, rate_idx: usize, freq_mhz: u32) -> u64 {
    let rate = u64::from(index_to_rate(rate_idx, freq_mhz));
    // len * 8 bits at (rate / 10) Mb/s.
    plcp_overhead(rate_idx, freq_mhz) + (len as u64 * 8 * 10).div_ceil(rate)
}

/// Duration of the ACK expected after a unicast attempt, sent at the
/// lowest basic rate of the band, plus the preceding SIFS [µs].
pub fn ack_time_us(freq_mhz: u32) -> u64 {
    band_timing(freq_mhz).sifs + pkt_duration_us(14, 0, freq_mhz)
}
