//! Top-level netlink and generic netlink message framing.
//!
//! [`MsgBuilder`] assembles one `nlmsghdr` + `genlmsghdr` + attributes
//! buffer, patching the total length on finish; [`NlMsg::parse_all`]
//! walks the messages packed into one `recv` buffer.

use crate::{err::DeError, nl::align};

/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;

/// `NLM_F_REQUEST` as the header-flags word expects it.
pub const NLM_F_REQUEST: u16 = libc::NLM_F_REQUEST as u16;

/// Size of `struct genlmsghdr`.
pub const GENL_HDRLEN: usize = 4;

/// Builder for one outgoing generic netlink message.
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    /// Start a generic netlink message for `family` with the given
    /// header flags, command and family version.
    pub fn genl(family: u16, flags: u16, cmd: u8, version: u8) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched
        buf.extend_from_slice(&family.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
        buf.push(cmd);
        buf.push(version);
        buf.extend_from_slice(&0u16.to_ne_bytes()); // reserved
        MsgBuilder { buf }
    }

    /// Set the sequence number.
    pub fn seq(mut self, seq: u32) -> Self {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self
    }

    /// The attribute area for the `nl::attr` writers.
    pub fn attrs(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Patch the length and return the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// A borrowed view of one received netlink message.
#[derive(Debug, Clone, Copy)]
pub struct NlMsg<'a> {
    /// Message type (family id, or a control value like `NLMSG_ERROR`).
    pub ty: u16,
    /// Header flags.
    pub flags: u16,
    /// Sequence number.
    pub seq: u32,
    /// Sender port id.
    pub pid: u32,
    /// Payload past the netlink header.
    pub payload: &'a [u8],
}

impl<'a> NlMsg<'a> {
    /// Parse every message packed into a receive buffer.
    pub fn parse_all(buf: &'a [u8]) -> NlMsgIter<'a> {
        NlMsgIter { buf }
    }

    /// True for `NLMSG_ERROR` packets; returns the error code (0 for
    /// an ACK).
    pub fn error_code(&self) -> Option<i32> {
        if u32::from(self.ty) != libc::NLMSG_ERROR as u32 {
            return None;
        }
        let bytes = self.payload.get(..4)?;
        Some(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Iterator over the netlink messages in one buffer.
pub struct NlMsgIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for NlMsgIter<'a> {
    type Item = Result<NlMsg<'a>, DeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(DeError::InvalidLength("netlink message")));
        }
        let msg = NlMsg {
            ty: u16::from_ne_bytes(self.buf[4..6].try_into().unwrap()),
            flags: u16::from_ne_bytes(self.buf[6..8].try_into().unwrap()),
            seq: u32::from_ne_bytes(self.buf[8..12].try_into().unwrap()),
            pid: u32::from_ne_bytes(self.buf[12..16].try_into().unwrap()),
            payload: &self.buf[NLMSG_HDRLEN..len],
        };
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some(Ok(msg))
    }
}

/// A parsed generic netlink header plus its attribute block.
#[derive(Debug, Clone, Copy)]
pub struct GenlMsg<'a> {
    /// Family command.
    pub cmd: u8,
    /// Family version.
    pub version: u8,
    /// Attribute block following the header.
    pub attrs: &'a [u8],
}

impl<'a> GenlMsg<'a> {
    /// Split a netlink payload into the generic header and attributes.
    pub fn parse(payload: &'a [u8]) -> Result<Self, DeError> {
        if payload.len() < GENL_HDRLEN {
            return Err(DeError::UnexpectedEob("genl header"));
        }
        Ok(GenlMsg {
            cmd: payload[0],
            version: payload[1],
            attrs: &payload[GENL_HDRLEN..],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nl::attr;

    #[test]
    fn test_builder_parse_roundtrip() {
        let mut builder = MsgBuilder::genl(0x1f, libc::NLM_F_REQUEST as u16, 2, 1).seq(99);
        attr::put_u32(builder.attrs(), 7, 2412);
        let wire = builder.finish();

        let msgs: Vec<_> = NlMsg::parse_all(&wire).collect::<Result<_, _>>().unwrap();
        assert_eq!(msgs.len(), 1);
        let msg = msgs[0];
        assert_eq!(msg.ty, 0x1f);
        assert_eq!(msg.seq, 99);
        let genl = GenlMsg::parse(msg.payload).unwrap();
        assert_eq!(genl.cmd, 2);
        assert_eq!(genl.version, 1);
        assert_eq!(
            attr::AttrIter::new(genl.attrs)
                .require(7, "freq")
                .unwrap()
                .get_u32()
                .unwrap(),
            2412
        );
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let a = MsgBuilder::genl(1, 0, 1, 1).finish();
        let b = MsgBuilder::genl(2, 0, 2, 1).finish();
        let mut wire = a.clone();
        wire.extend_from_slice(&b);
        let msgs: Vec<_> = NlMsg::parse_all(&wire).collect::<Result<_, _>>().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].ty, 1);
        assert_eq!(msgs[1].ty, 2);
    }

    #[test]
    fn test_error_packet_detection() {
        let mut wire = MsgBuilder::genl(libc::NLMSG_ERROR as u16, 0, 0, 0).finish();
        // Overwrite the genl header area with an errno payload.
        wire.truncate(NLMSG_HDRLEN);
        wire.extend_from_slice(&(-libc::ENOENT).to_ne_bytes());
        let wire_len = wire.len() as u32;
        wire[0..4].copy_from_slice(&wire_len.to_ne_bytes());

        let msg = NlMsg::parse_all(&wire).next().unwrap().unwrap();
        assert_eq!(msg.error_code(), Some(-libc::ENOENT));
    }

    #[test]
    fn test_truncated_buffer_is_an_error() {
        let mut wire = MsgBuilder::genl(1, 0, 1, 1).finish();
        wire[0..4].copy_from_slice(&1024u32.to_ne_bytes());
        assert!(NlMsg::parse_all(&wire).next().unwrap().is_err());
    }
}
