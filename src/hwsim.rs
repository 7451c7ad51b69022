//! The Linux `mac80211_hwsim` generic netlink family: commands,
//! attributes, transmission flags and the typed message records the
//! engine works with.
//!
//! Constants mirror the in-driver header file. They are only available
//! there; like other Wi-Fi userspace (`hostapd`, `iwd`, wmediumd
//! itself) we carry our own copy.

use std::fmt;

use bitflags::bitflags;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};

use crate::{
    err::DeError,
    ieee80211::{MacAddr, TX_MAX_RATES},
    nl::{
        attr::{self, AttrIter},
        msg::MsgBuilder,
    },
};

/// Name the family registers under.
pub const FAMILY_NAME: &str = "MAC80211_HWSIM";

/// Multicast group carrying radio lifecycle events.
pub const MCAST_GROUP_CONFIG: &str = "config";

/// Family protocol version.
pub const VERSION_NR: u8 = 1;

// Maps an integer-backed enum to and from its wire value, keeping
// unknown values representable instead of failing the whole message.
macro_rules! impl_var {
    (
        $(#[$outer:meta])*
        $name:ident, $ty:ty,
        $( $(#[$inner:meta])* $var:ident => $val:expr ),* $(,)?
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$inner])* $var, )*
            /// Constant not known to this build.
            UnrecognizedVariant($ty),
        }

        impl From<$ty> for $name {
            fn from(v: $ty) -> Self {
                match v {
                    $( i if i == $val => $name::$var, )*
                    i => $name::UnrecognizedVariant(i),
                }
            }
        }

        impl From<$name> for $ty {
            fn from(v: $name) -> Self {
                match v {
                    $( $name::$var => $val, )*
                    $name::UnrecognizedVariant(i) => i,
                }
            }
        }
    };
}

impl_var!(
    /// Commands of the `mac80211_hwsim` family.
    HwsimCmd, u8,
    /// Unspecified command to catch errors.
    Unspec => 0,
    /// Register to receive every frame any hwsim radio transmits.
    Register => 1,
    /// A frame crossing the medium, in either direction.
    Frame => 2,
    /// Transmission status report back to the kernel.
    TxInfoFrame => 3,
    /// Radio created; multicast on the `config` group.
    NewRadio => 4,
    /// Radio destroyed; multicast on the `config` group.
    DelRadio => 5,
    /// Query existing radios.
    GetRadio => 6,
    /// Attach a receive MAC address to a radio.
    AddMacAddr => 7,
    /// Detach a receive MAC address from a radio.
    DelMacAddr => 8,
    /// Start a peer measurement.
    StartPmsr => 9,
    /// Abort an in-flight peer measurement.
    AbortPmsr => 10,
    /// Peer measurement results.
    ReportPmsr => 11,
);

impl_var!(
    /// Attributes of the `mac80211_hwsim` family.
    HwsimAttr, u16,
    /// Unspecified attribute to catch errors.
    Unspec => 0,
    /// MAC address the frame is delivered to.
    AddrReceiver => 1,
    /// MAC address of the transmitting radio.
    AddrTransmitter => 2,
    /// Raw 802.11 frame bytes.
    Frame => 3,
    /// `mac80211` transmission flags.
    Flags => 4,
    /// Estimated RX rate index.
    RxRate => 5,
    /// Estimated RX signal [dBm].
    Signal => 6,
    /// `ieee80211_tx_rate` array: the rate retry schedule.
    TxInfo => 7,
    /// Opaque cookie correlating TX and TX-status.
    Cookie => 8,
    /// Channel count of a new radio.
    Channels => 9,
    /// Radio id for deletion.
    RadioId => 10,
    /// Regulatory hint alpha2.
    RegHintAlpha2 => 11,
    /// Custom regulatory domain index.
    RegCustomReg => 12,
    /// Strict regulatory flag.
    RegStrictReg => 13,
    /// P2P device support flag.
    SupportP2pDevice => 14,
    /// Force channel contexts.
    UseChanctx => 15,
    /// Destroy radio with the creating process.
    DestroyRadioOnClose => 16,
    /// Radio name, e.g. `phy666`.
    RadioName => 17,
    /// Do not create a vif along with the radio.
    NoVif => 18,
    /// Frequency the frame is on [MHz].
    Freq => 19,
    /// 64-bit alignment padding; ignored.
    Pad => 20,
    /// Per-rate flags matching `TxInfo`.
    TxInfoFlags => 21,
    /// Permanent MAC address of a new radio.
    PermAddr => 22,
    /// Supported interface type bits.
    IftypeSupport => 23,
    /// Supported cipher list.
    CipherSupport => 24,
    /// MLO support flag.
    MloSupport => 25,
    /// Peer measurement capabilities (nested).
    PmsrSupport => 26,
    /// Peer measurement request (nested).
    PmsrRequest => 27,
    /// Peer measurement result (nested).
    PmsrResult => 28,
    /// One radio per band flag.
    MultiRadio => 29,
    /// NAN device support flag.
    SupportNanDevice => 30,
);

bitflags! {
    /// Flags on [`HwsimAttr::Flags`] describing how to treat the frame
    /// and, on the way back, how it fared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxControlFlags: u32 {
        /// The kernel wants a TX status callback for this frame.
        const REQ_TX_STATUS = 1;
        /// Do not wait for an ACK.
        const NO_ACK = 1 << 1;
        /// Frame was acknowledged.
        const STAT_ACK = 1 << 2;
    }
}

/// One `(rate index, attempt count)` entry of a retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRate {
    /// Rate table index; negative ends the schedule.
    pub idx: i8,
    /// Attempts to make at this rate.
    pub count: u8,
}

fn parse_tx_rates(payload: &[u8]) -> Vec<TxRate> {
    payload
        .chunks_exact(2)
        .take(TX_MAX_RATES)
        .map(|pair| TxRate {
            idx: pair[0] as i8,
            count: pair[1],
        })
        .collect()
}

fn tx_rates_bytes(rates: &[TxRate]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(rates.len() * 2);
    for rate in rates.iter().take(TX_MAX_RATES) {
        bytes.push(rate.idx as u8);
        bytes.push(rate.count);
    }
    bytes
}

/// A `HWSIM_CMD_FRAME` from the kernel: a frame some radio wants on
/// the air.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct FrameMessage {
    /// Transmitting radio's hardware address.
    #[getset(get_copy = "pub")]
    transmitter: MacAddr,
    /// Raw 802.11 frame bytes.
    #[getset(get = "pub")]
    data: Vec<u8>,
    /// Transmission control flags.
    #[getset(get_copy = "pub")]
    flags: TxControlFlags,
    /// Rate retry schedule.
    #[getset(get = "pub")]
    tx_rates: Vec<TxRate>,
    /// Cookie to echo in the status report.
    #[getset(get_copy = "pub")]
    cookie: u64,
    /// Frequency [MHz]; 0 when the driver did not say.
    #[getset(get_copy = "pub")]
    freq: u32,
}

impl FrameMessage {
    /// Parse the attribute block of a `Frame` command.
    pub fn parse(attrs: &[u8]) -> Result<Self, DeError> {
        let attrs = AttrIter::new(attrs);
        let transmitter = attrs
            .require(HwsimAttr::AddrTransmitter.into(), "HWSIM_ATTR_ADDR_TRANSMITTER")?
            .get_mac()?;
        let data = attrs
            .require(HwsimAttr::Frame.into(), "HWSIM_ATTR_FRAME")?
            .payload
            .to_vec();
        let flags = attrs
            .find(HwsimAttr::Flags.into())?
            .map(|a| a.get_u32())
            .transpose()?
            .map(TxControlFlags::from_bits_truncate)
            .unwrap_or_default();
        let tx_rates = attrs
            .find(HwsimAttr::TxInfo.into())?
            .map(|a| parse_tx_rates(a.payload))
            .unwrap_or_default();
        let cookie = attrs
            .find(HwsimAttr::Cookie.into())?
            .map(|a| a.get_u64())
            .transpose()?
            .unwrap_or(0);
        let freq = attrs
            .find(HwsimAttr::Freq.into())?
            .map(|a| a.get_u32())
            .transpose()?
            .unwrap_or(2412);
        Ok(FrameMessage {
            transmitter,
            data,
            flags,
            tx_rates,
            cookie,
            freq,
        })
    }

    /// Encode a frame delivery to `receiver` as the kernel expects it.
    pub fn build_delivery(
        family: u16,
        receiver: MacAddr,
        data: &[u8],
        rate_idx: u32,
        signal: i32,
        freq: u32,
    ) -> Vec<u8> {
        let mut builder = MsgBuilder::genl(
            family,
            libc::NLM_F_REQUEST as u16,
            HwsimCmd::Frame.into(),
            VERSION_NR,
        );
        let buf = builder.attrs();
        attr::put(buf, HwsimAttr::AddrReceiver.into(), receiver.as_bytes());
        attr::put(buf, HwsimAttr::Frame.into(), data);
        attr::put_u32(buf, HwsimAttr::RxRate.into(), rate_idx);
        attr::put_u32(buf, HwsimAttr::Signal.into(), signal as u32);
        attr::put_u32(buf, HwsimAttr::Freq.into(), freq);
        builder.finish()
    }
}

/// The TX status report closing out one accepted frame.
#[derive(Debug, Clone)]
pub struct TxInfoMessage {
    /// Transmitting radio's hardware address.
    pub transmitter: MacAddr,
    /// Flags with [`TxControlFlags::STAT_ACK`] set on success.
    pub flags: TxControlFlags,
    /// Signal estimate reported to the rate control algorithm [dBm].
    pub signal: i32,
    /// Retry schedule with the attempt counts actually used.
    pub tx_rates: Vec<TxRate>,
    /// Cookie copied from the original frame.
    pub cookie: u64,
}

impl TxInfoMessage {
    /// Encode as a `TX_INFO_FRAME` command.
    pub fn build(&self, family: u16) -> Vec<u8> {
        let mut builder = MsgBuilder::genl(
            family,
            libc::NLM_F_REQUEST as u16,
            HwsimCmd::TxInfoFrame.into(),
            VERSION_NR,
        );
        let buf = builder.attrs();
        attr::put(
            buf,
            HwsimAttr::AddrTransmitter.into(),
            self.transmitter.as_bytes(),
        );
        attr::put_u32(buf, HwsimAttr::Flags.into(), self.flags.bits());
        attr::put_u32(buf, HwsimAttr::Signal.into(), self.signal as u32);
        attr::put(buf, HwsimAttr::TxInfo.into(), &tx_rates_bytes(&self.tx_rates));
        attr::put_u64(buf, HwsimAttr::Cookie.into(), self.cookie);
        builder.finish()
    }

    /// Parse the attribute block of a `TxInfoFrame` command; used by
    /// control-socket clients that replay kernel traffic at us and by
    /// the tests.
    pub fn parse(attrs: &[u8]) -> Result<Self, DeError> {
        let attrs = AttrIter::new(attrs);
        Ok(TxInfoMessage {
            transmitter: attrs
                .require(HwsimAttr::AddrTransmitter.into(), "HWSIM_ATTR_ADDR_TRANSMITTER")?
                .get_mac()?,
            flags: TxControlFlags::from_bits_truncate(
                attrs
                    .require(HwsimAttr::Flags.into(), "HWSIM_ATTR_FLAGS")?
                    .get_u32()?,
            ),
            signal: attrs
                .find(HwsimAttr::Signal.into())?
                .map(|a| a.get_u32())
                .transpose()?
                .unwrap_or(0) as i32,
            tx_rates: attrs
                .find(HwsimAttr::TxInfo.into())?
                .map(|a| parse_tx_rates(a.payload))
                .unwrap_or_default(),
            cookie: attrs
                .find(HwsimAttr::Cookie.into())?
                .map(|a| a.get_u64())
                .transpose()?
                .unwrap_or(0),
        })
    }
}

/// A `NEW_RADIO` event from the `config` multicast group.
#[derive(Debug, Clone, Default, Builder)]
#[builder(pattern = "owned", default)]
pub struct NewRadioMessage {
    /// Radio id assigned by the driver.
    pub radio_id: Option<u32>,
    /// Permanent hardware address.
    pub perm_addr: Option<MacAddr>,
    /// Channel count.
    pub channels: Option<u32>,
    /// Radio name.
    pub radio_name: Option<String>,
    /// Radio was created without a vif.
    pub no_vif: bool,
    /// Radio claims peer measurement support; raw nested capabilities.
    pub pmsr_support: Option<Vec<u8>>,
}

impl NewRadioMessage {
    /// Parse the attribute block of a `NewRadio` command.
    pub fn parse(attrs: &[u8]) -> Result<Self, DeError> {
        let attrs = AttrIter::new(attrs);
        let mut builder = NewRadioMessageBuilder::default();
        if let Some(a) = attrs.find(HwsimAttr::RadioId.into())? {
            builder = builder.radio_id(Some(a.get_u32()?));
        }
        if let Some(a) = attrs.find(HwsimAttr::PermAddr.into())? {
            builder = builder.perm_addr(Some(a.get_mac()?));
        }
        if let Some(a) = attrs.find(HwsimAttr::Channels.into())? {
            builder = builder.channels(Some(a.get_u32()?));
        }
        if let Some(a) = attrs.find(HwsimAttr::RadioName.into())? {
            builder = builder.radio_name(Some(a.get_str()?.to_string()));
        }
        if attrs.find(HwsimAttr::NoVif.into())?.is_some() {
            builder = builder.no_vif(true);
        }
        if let Some(a) = attrs.find(HwsimAttr::PmsrSupport.into())? {
            builder = builder.pmsr_support(Some(a.payload.to_vec()));
        }
        builder
            .build()
            .map_err(|e| DeError::InvalidValue(e.to_string()))
    }
}

/// A `DEL_RADIO` event.
#[derive(Debug, Clone, Copy)]
pub struct DelRadioMessage {
    /// Radio id, when present.
    pub radio_id: Option<u32>,
    /// Permanent hardware address, when present.
    pub perm_addr: Option<MacAddr>,
}

impl DelRadioMessage {
    /// Parse the attribute block of a `DelRadio` command.
    pub fn parse(attrs: &[u8]) -> Result<Self, DeError> {
        let attrs = AttrIter::new(attrs);
        let radio_id = attrs
            .find(HwsimAttr::RadioId.into())?
            .map(|a| a.get_u32())
            .transpose()?;
        let perm_addr = attrs
            .find(HwsimAttr::PermAddr.into())?
            .map(|a| a.get_mac())
            .transpose()?;
        if radio_id.is_none() && perm_addr.is_none() {
            return Err(DeError::MissingAttribute(
                "HWSIM_ATTR_RADIO_ID or HWSIM_ATTR_PERM_ADDR",
            ));
        }
        Ok(DelRadioMessage {
            radio_id,
            perm_addr,
        })
    }
}

/// An `ADD_MAC_ADDR`/`DEL_MAC_ADDR` pair of addresses.
#[derive(Debug, Clone, Copy)]
pub struct MacAddrMessage {
    /// The radio the address belongs to.
    pub transmitter: MacAddr,
    /// The address being attached or detached.
    pub receiver: MacAddr,
}

impl MacAddrMessage {
    /// Parse the attribute block of an `AddMacAddr`/`DelMacAddr`.
    pub fn parse(attrs: &[u8]) -> Result<Self, DeError> {
        let attrs = AttrIter::new(attrs);
        Ok(MacAddrMessage {
            transmitter: attrs
                .require(HwsimAttr::AddrTransmitter.into(), "HWSIM_ATTR_ADDR_TRANSMITTER")?
                .get_mac()?,
            receiver: attrs
                .require(HwsimAttr::AddrReceiver.into(), "HWSIM_ATTR_ADDR_RECEIVER")?
                .get_mac()?,
        })
    }
}

/// Build the `REGISTER` request announcing this socket as the medium.
pub fn build_register(family: u16) -> Vec<u8> {
    MsgBuilder::genl(
        family,
        libc::NLM_F_REQUEST as u16,
        HwsimCmd::Register.into(),
        VERSION_NR,
    )
    .finish()
}

impl fmt::Display for HwsimCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nl::msg::{GenlMsg, NlMsg};

    fn frame_attrs(transmitter: MacAddr, data: &[u8], rates: &[TxRate]) -> Vec<u8> {
        let mut buf = Vec::new();
        attr::put(&mut buf, HwsimAttr::AddrTransmitter.into(), transmitter.as_bytes());
        attr::put(&mut buf, HwsimAttr::Frame.into(), data);
        attr::put_u32(
            &mut buf,
            HwsimAttr::Flags.into(),
            TxControlFlags::REQ_TX_STATUS.bits(),
        );
        attr::put(&mut buf, HwsimAttr::TxInfo.into(), &tx_rates_bytes(rates));
        attr::put_u64(&mut buf, HwsimAttr::Cookie.into(), 0xc00c1e);
        attr::put_u32(&mut buf, HwsimAttr::Freq.into(), 2412);
        buf
    }

    #[test]
    fn test_cmd_enum_roundtrip() {
        assert_eq!(HwsimCmd::from(2u8), HwsimCmd::Frame);
        assert_eq!(u8::from(HwsimCmd::ReportPmsr), 11);
        assert_eq!(HwsimCmd::from(200u8), HwsimCmd::UnrecognizedVariant(200));
    }

    #[test]
    fn test_frame_message_parse() {
        let mac = MacAddr([2, 0, 0, 0, 0, 0]);
        let rates = [TxRate { idx: 0, count: 3 }, TxRate { idx: -1, count: 0 }];
        let attrs = frame_attrs(mac, &[1, 2, 3, 4], &rates);
        let msg = FrameMessage::parse(&attrs).unwrap();
        assert_eq!(msg.transmitter(), mac);
        assert_eq!(msg.data(), &[1, 2, 3, 4]);
        assert!(msg.flags().contains(TxControlFlags::REQ_TX_STATUS));
        assert_eq!(msg.tx_rates().len(), 2);
        assert_eq!(msg.tx_rates()[0].count, 3);
        assert_eq!(msg.tx_rates()[1].idx, -1);
        assert_eq!(msg.cookie(), 0xc00c1e);
        assert_eq!(msg.freq(), 2412);
    }

    #[test]
    fn test_frame_message_missing_transmitter() {
        let mut buf = Vec::new();
        attr::put(&mut buf, HwsimAttr::Frame.into(), &[0u8; 10]);
        assert!(matches!(
            FrameMessage::parse(&buf),
            Err(DeError::MissingAttribute(_))
        ));
    }

    #[test]
    fn test_tx_info_roundtrip() {
        let msg = TxInfoMessage {
            transmitter: MacAddr([2, 0, 0, 0, 0, 1]),
            flags: TxControlFlags::REQ_TX_STATUS | TxControlFlags::STAT_ACK,
            signal: -52,
            tx_rates: vec![TxRate { idx: 0, count: 1 }],
            cookie: 99,
        };
        let wire = msg.build(0x23);
        let nl = NlMsg::parse_all(&wire).next().unwrap().unwrap();
        assert_eq!(nl.ty, 0x23);
        let genl = GenlMsg::parse(nl.payload).unwrap();
        assert_eq!(HwsimCmd::from(genl.cmd), HwsimCmd::TxInfoFrame);
        let parsed = TxInfoMessage::parse(genl.attrs).unwrap();
        assert_eq!(parsed.transmitter, msg.transmitter);
        assert!(parsed.flags.contains(TxControlFlags::STAT_ACK));
        assert_eq!(parsed.signal, -52);
        assert_eq!(parsed.cookie, 99);
    }

    #[test]
    fn test_delivery_encoding() {
        let wire = FrameMessage::build_delivery(
            0x23,
            MacAddr([2, 0, 0, 0, 0, 1]),
            &[0xaa; 24],
            0,
            -61,
            2412,
        );
        let nl = NlMsg::parse_all(&wire).next().unwrap().unwrap();
        let genl = GenlMsg::parse(nl.payload).unwrap();
        assert_eq!(HwsimCmd::from(genl.cmd), HwsimCmd::Frame);
        let attrs = AttrIter::new(genl.attrs);
        assert_eq!(
            attrs
                .require(HwsimAttr::Signal.into(), "signal")
                .unwrap()
                .get_u32()
                .unwrap() as i32,
            -61
        );
        assert_eq!(
            attrs
                .require(HwsimAttr::AddrReceiver.into(), "receiver")
                .unwrap()
                .get_mac()
                .unwrap(),
            MacAddr([2, 0, 0, 0, 0, 1])
        );
    }

    #[test]
    fn test_new_radio_parse() {
        let mut buf = Vec::new();
        attr::put_u32(&mut buf, HwsimAttr::RadioId.into(), 3);
        attr::put(
            &mut buf,
            HwsimAttr::PermAddr.into(),
            &[0x42, 0, 0, 0, 3, 0],
        );
        attr::put_str(&mut buf, HwsimAttr::RadioName.into(), "phy3");
        attr::put_flag(&mut buf, HwsimAttr::NoVif.into());
        let msg = NewRadioMessage::parse(&buf).unwrap();
        assert_eq!(msg.radio_id, Some(3));
        assert_eq!(msg.perm_addr, Some(MacAddr([0x42, 0, 0, 0, 3, 0])));
        assert_eq!(msg.radio_name.as_deref(), Some("phy3"));
        assert!(msg.no_vif);
        assert!(msg.pmsr_support.is_none());
    }

    #[test]
    fn test_del_radio_requires_an_identifier() {
        assert!(DelRadioMessage::parse(&[]).is_err());
        let mut buf = Vec::new();
        attr::put_u32(&mut buf, HwsimAttr::RadioId.into(), 7);
        assert_eq!(
            DelRadioMessage::parse(&buf).unwrap().radio_id,
            Some(7)
        );
    }
}
