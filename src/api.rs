//! The stream protocol spoken on the control socket.
//!
//! Messages are framed by a fixed 8-byte header `{u32 type, u32
//! data_len}` followed by `data_len` bytes, everything native endian
//! since both ends are local. Every request is answered with an `Ack`
//! before the next message on that connection is processed; the ack
//! carries a status word (absent or zero means success) so protocol
//! errors are visible to the client.

use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    err::{ApiError, DeError},
    ieee80211::{MacAddr, ETH_ALEN},
    station::StationInfo,
};

/// Upper bound on a control message body; generous enough for an
/// encapsulated netlink frame.
pub const MAX_BODY_LEN: u32 = 65536;

/// Message types, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMsgType {
    /// Invalid message.
    Invalid,
    /// Acknowledgement, returned for each message for synchronisation.
    Ack,
    /// Subscribe to frames.
    Register,
    /// Unsubscribe from frames.
    Unregister,
    /// An encapsulated netlink message, treated like driver traffic.
    Netlink,
    /// Set control flags; see [`CtlFlags`].
    SetControl,
    /// Outbound TX-start notification.
    TxStart,
    /// List known stations.
    GetNodes,
    /// Pin the SNR between two nodes.
    SetSnr,
    /// Reload the configuration at a given path.
    ReloadConfig,
    /// Reload the configuration loaded before.
    ReloadCurrentConfig,
    /// Type value not known to this server.
    UnrecognizedVariant(u32),
}

impl From<u32> for ApiMsgType {
    fn from(v: u32) -> Self {
        match v {
            0 => ApiMsgType::Invalid,
            1 => ApiMsgType::Ack,
            2 => ApiMsgType::Register,
            3 => ApiMsgType::Unregister,
            4 => ApiMsgType::Netlink,
            5 => ApiMsgType::SetControl,
            6 => ApiMsgType::TxStart,
            7 => ApiMsgType::GetNodes,
            8 => ApiMsgType::SetSnr,
            9 => ApiMsgType::ReloadConfig,
            10 => ApiMsgType::ReloadCurrentConfig,
            other => ApiMsgType::UnrecognizedVariant(other),
        }
    }
}

impl From<ApiMsgType> for u32 {
    fn from(v: ApiMsgType) -> Self {
        match v {
            ApiMsgType::Invalid => 0,
            ApiMsgType::Ack => 1,
            ApiMsgType::Register => 2,
            ApiMsgType::Unregister => 3,
            ApiMsgType::Netlink => 4,
            ApiMsgType::SetControl => 5,
            ApiMsgType::TxStart => 6,
            ApiMsgType::GetNodes => 7,
            ApiMsgType::SetSnr => 8,
            ApiMsgType::ReloadConfig => 9,
            ApiMsgType::ReloadCurrentConfig => 10,
            ApiMsgType::UnrecognizedVariant(other) => other,
        }
    }
}

bitflags! {
    /// Per-client control flags set with [`ApiMsgType::SetControl`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtlFlags: u32 {
        /// Notify this client when a transmission starts.
        const NOTIFY_TX_START = 1 << 0;
        /// Copy every delivered frame to this client.
        const RX_ALL_FRAMES = 1 << 1;
    }
}

/// One framed message.
#[derive(Debug, Clone)]
pub struct ApiMessage {
    /// Message type.
    pub ty: ApiMsgType,
    /// Body bytes.
    pub data: Vec<u8>,
}

impl ApiMessage {
    /// A bodyless message of the given type.
    pub fn empty(ty: ApiMsgType) -> Self {
        ApiMessage {
            ty,
            data: Vec::new(),
        }
    }

    /// A success acknowledgement.
    pub fn ack() -> Self {
        ApiMessage::empty(ApiMsgType::Ack)
    }

    /// An acknowledgement carrying a nonzero error status.
    pub fn error_ack(status: u32) -> Self {
        ApiMessage {
            ty: ApiMsgType::Ack,
            data: status.to_ne_bytes().to_vec(),
        }
    }
}

/// Read one framed message from a stream.
pub fn read_message<R: Read>(stream: &mut R) -> Result<ApiMessage, ApiError> {
    let ty = stream.read_u32::<NativeEndian>()?;
    let data_len = stream.read_u32::<NativeEndian>()?;
    if data_len > MAX_BODY_LEN {
        return Err(ApiError::Oversize(data_len));
    }
    let mut data = vec![0u8; data_len as usize];
    stream.read_exact(&mut data)?;
    Ok(ApiMessage {
        ty: ApiMsgType::from(ty),
        data,
    })
}

/// Write one framed message to a stream.
pub fn write_message<W: Write>(stream: &mut W, msg: &ApiMessage) -> Result<(), ApiError> {
    stream.write_u32::<NativeEndian>(u32::from(msg.ty))?;
    stream.write_u32::<NativeEndian>(msg.data.len() as u32)?;
    stream.write_all(&msg.data)?;
    stream.flush()?;
    Ok(())
}

/// Body of [`ApiMsgType::SetSnr`]: two MACs and the SNR, packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSnrPayload {
    /// First endpoint.
    pub node1: MacAddr,
    /// Second endpoint.
    pub node2: MacAddr,
    /// SNR to pin [dB].
    pub snr: u8,
}

impl SetSnrPayload {
    /// Parse the packed 13-byte body.
    pub fn parse(data: &[u8]) -> Result<Self, DeError> {
        if data.len() < 2 * ETH_ALEN + 1 {
            return Err(DeError::UnexpectedEob("wmediumd_set_snr"));
        }
        Ok(SetSnrPayload {
            node1: MacAddr::from_slice(&data[..ETH_ALEN])?,
            node2: MacAddr::from_slice(&data[ETH_ALEN..2 * ETH_ALEN])?,
            snr: data[2 * ETH_ALEN],
        })
    }

    /// Encode the packed body.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(13);
        data.extend_from_slice(self.node1.as_bytes());
        data.extend_from_slice(self.node2.as_bytes());
        data.push(self.snr);
        data
    }
}

/// Body of [`ApiMsgType::TxStart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStartPayload {
    /// Cookie of the starting frame; set only in the copy sent to the
    /// frame's source, zero for everyone else.
    pub cookie: u64,
    /// Frequency [MHz].
    pub freq: u32,
}

impl TxStartPayload {
    /// Encode the 24-byte body, reserved words zeroed.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(24);
        data.extend_from_slice(&self.cookie.to_ne_bytes());
        data.extend_from_slice(&self.freq.to_ne_bytes());
        data.extend_from_slice(&[0u8; 12]);
        data
    }

    /// Parse the body.
    pub fn parse(data: &[u8]) -> Result<Self, DeError> {
        if data.len() < 12 {
            return Err(DeError::UnexpectedEob("wmediumd_tx_start"));
        }
        Ok(TxStartPayload {
            cookie: u64::from_ne_bytes(data[..8].try_into().unwrap()),
            freq: u32::from_ne_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

/// Parse a [`ApiMsgType::SetControl`] body. Shorter bodies than we
/// know about default the missing flags to zero; longer ones have
/// their tail ignored, both for compatibility.
pub fn parse_control(data: &[u8]) -> CtlFlags {
    let mut flags = 0u32;
    if data.len() >= 4 {
        flags = u32::from_ne_bytes(data[..4].try_into().unwrap());
    }
    CtlFlags::from_bits_truncate(flags)
}

/// Parse a reload path body: a NUL-terminated string.
pub fn parse_path(data: &[u8]) -> Result<String, DeError> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|_| DeError::InvalidValue("reload path is not valid UTF-8".into()))
}

/// Encode the [`ApiMsgType::GetNodes`] reply body: a count followed
/// by one packed record per station.
pub fn encode_nodes(stations: &[StationInfo]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + stations.len() * 36);
    data.extend_from_slice(&(stations.len() as u32).to_ne_bytes());
    for station in stations {
        data.extend_from_slice(station.hwaddr.as_bytes());
        data.extend_from_slice(station.addr.as_bytes());
        data.extend_from_slice(&station.x.to_ne_bytes());
        data.extend_from_slice(&station.y.to_ne_bytes());
        data.extend_from_slice(&station.tx_power.to_ne_bytes());
    }
    data
}

/// Decode a [`ApiMsgType::GetNodes`] reply body.
pub fn parse_nodes(data: &[u8]) -> Result<Vec<(MacAddr, MacAddr, f64, f64, f64)>, DeError> {
    let mut cursor = std::io::Cursor::new(data);
    let count = cursor
        .read_u32::<NativeEndian>()
        .map_err(|_| DeError::UnexpectedEob("node count"))?;
    let mut nodes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut hwaddr = [0u8; ETH_ALEN];
        let mut addr = [0u8; ETH_ALEN];
        cursor
            .read_exact(&mut hwaddr)
            .map_err(|_| DeError::UnexpectedEob("node record"))?;
        cursor
            .read_exact(&mut addr)
            .map_err(|_| DeError::UnexpectedEob("node record"))?;
        let x = cursor
            .read_f64::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("node record"))?;
        let y = cursor
            .read_f64::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("node record"))?;
        let tx_power = cursor
            .read_f64::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("node record"))?;
        nodes.push((MacAddr(hwaddr), MacAddr(addr), x, y, tx_power));
    }
    Ok(nodes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_message_framing_roundtrip() {
        let msg = ApiMessage {
            ty: ApiMsgType::SetSnr,
            data: vec![1, 2, 3],
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &msg).unwrap();
        assert_eq!(wire.len(), 8 + 3);
        let parsed = read_message(&mut wire.as_slice()).unwrap();
        assert_eq!(parsed.ty, ApiMsgType::SetSnr);
        assert_eq!(parsed.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_oversize_body_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1u32.to_ne_bytes());
        wire.extend_from_slice(&(MAX_BODY_LEN + 1).to_ne_bytes());
        assert!(matches!(
            read_message(&mut wire.as_slice()),
            Err(ApiError::Oversize(_))
        ));
    }

    #[test]
    fn test_set_snr_payload() {
        let payload = SetSnrPayload {
            node1: MacAddr([2, 0, 0, 0, 0, 0]),
            node2: MacAddr([2, 0, 0, 0, 0, 1]),
            snr: 5,
        };
        let parsed = SetSnrPayload::parse(&payload.encode()).unwrap();
        assert_eq!(parsed, payload);
        assert!(SetSnrPayload::parse(&[0; 12]).is_err());
    }

    #[test]
    fn test_tx_start_payload() {
        let payload = TxStartPayload {
            cookie: 0xdead,
            freq: 5180,
        };
        let encoded = payload.encode();
        assert_eq!(encoded.len(), 24);
        assert_eq!(TxStartPayload::parse(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_control_compatibility_rules() {
        assert_eq!(parse_control(&[]), CtlFlags::empty());
        let flags = (CtlFlags::NOTIFY_TX_START | CtlFlags::RX_ALL_FRAMES).bits();
        let mut long = flags.to_ne_bytes().to_vec();
        long.extend_from_slice(&[0xff; 8]);
        assert_eq!(
            parse_control(&long),
            CtlFlags::NOTIFY_TX_START | CtlFlags::RX_ALL_FRAMES
        );
    }

    #[test]
    fn test_nodes_roundtrip() {
        let stations = vec![StationInfo {
            addr: MacAddr([2, 0, 0, 0, 0, 0]),
            hwaddr: MacAddr([0x42, 0, 0, 0, 0, 0]),
            x: 1.5,
            y: -2.0,
            tx_power: 20.0,
            lci: None,
            civicloc: None,
        }];
        let nodes = parse_nodes(&encode_nodes(&stations)).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, stations[0].hwaddr);
        assert_eq!(nodes[0].2, 1.5);
        assert_eq!(nodes[0].4, 20.0);
    }
}
