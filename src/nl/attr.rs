//! Netlink attribute encoding and parsing.
//!
//! Writers append `nlattr`-framed payloads to a growing buffer and
//! handle the trailing alignment; the iterator walks a received
//! attribute block and yields typed views. Nesting works the same way
//! in both directions: a nested attribute is just an attribute whose
//! payload is another attribute block.

use std::io::Cursor;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::{err::DeError, ieee80211::MacAddr, nl::align};

/// Size of the attribute header (`nla_len` + `nla_type`).
pub const NLA_HDRLEN: usize = 4;

/// Flag bit marking an attribute whose payload is nested attributes.
pub const NLA_F_NESTED: u16 = 1 << 15;

const NLA_TYPE_MASK: u16 = !(3 << 14);

/// Append one attribute with an opaque payload.
pub fn put(buf: &mut Vec<u8>, ty: u16, payload: &[u8]) {
    let len = (NLA_HDRLEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&ty.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(buf.len()), 0);
}

/// Append a flag attribute (presence only, empty payload).
pub fn put_flag(buf: &mut Vec<u8>, ty: u16) {
    put(buf, ty, &[]);
}

/// Append a `u8` attribute.
pub fn put_u8(buf: &mut Vec<u8>, ty: u16, value: u8) {
    put(buf, ty, &[value]);
}

/// Append a `u16` attribute.
pub fn put_u16(buf: &mut Vec<u8>, ty: u16, value: u16) {
    put(buf, ty, &value.to_ne_bytes());
}

/// Append a `u32` attribute.
pub fn put_u32(buf: &mut Vec<u8>, ty: u16, value: u32) {
    put(buf, ty, &value.to_ne_bytes());
}

/// Append an `i32` attribute.
pub fn put_i32(buf: &mut Vec<u8>, ty: u16, value: i32) {
    put(buf, ty, &value.to_ne_bytes());
}

/// Append a `u64` attribute.
pub fn put_u64(buf: &mut Vec<u8>, ty: u16, value: u64) {
    put(buf, ty, &value.to_ne_bytes());
}

/// Append a NUL-terminated string attribute.
pub fn put_str(buf: &mut Vec<u8>, ty: u16, value: &str) {
    let mut payload = Vec::with_capacity(value.len() + 1);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    put(buf, ty, &payload);
}

/// Open a nested attribute; close it with [`end_nested`] passing the
/// returned offset.
pub fn begin_nested(buf: &mut Vec<u8>, ty: u16) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
    start
}

/// Patch the length of a nested attribute opened at `start`.
pub fn end_nested(buf: &mut Vec<u8>, start: usize) {
    let len = (buf.len() - start) as u16;
    buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    // Nested blocks end aligned because every member is.
}

/// A parsed view of one attribute.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    /// Attribute type with the nested/byte-order bits masked off.
    pub ty: u16,
    /// Raw payload bytes, alignment stripped.
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    fn expect_len(&self, len: usize, what: &'static str) -> Result<(), DeError> {
        if self.payload.len() < len {
            Err(DeError::UnexpectedEob(what))
        } else {
            Ok(())
        }
    }

    /// Payload as `u8`.
    pub fn get_u8(&self) -> Result<u8, DeError> {
        self.expect_len(1, "u8 attribute")?;
        Ok(self.payload[0])
    }

    /// Payload as native-endian `u16`.
    pub fn get_u16(&self) -> Result<u16, DeError> {
        self.expect_len(2, "u16 attribute")?;
        Cursor::new(self.payload)
            .read_u16::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("u16 attribute"))
    }

    /// Payload as native-endian `u32`.
    pub fn get_u32(&self) -> Result<u32, DeError> {
        self.expect_len(4, "u32 attribute")?;
        Cursor::new(self.payload)
            .read_u32::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("u32 attribute"))
    }

    /// Payload as native-endian `i32`.
    pub fn get_i32(&self) -> Result<i32, DeError> {
        self.expect_len(4, "i32 attribute")?;
        Cursor::new(self.payload)
            .read_i32::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("i32 attribute"))
    }

    /// Payload as native-endian `u64`.
    pub fn get_u64(&self) -> Result<u64, DeError> {
        self.expect_len(8, "u64 attribute")?;
        Cursor::new(self.payload)
            .read_u64::<NativeEndian>()
            .map_err(|_| DeError::UnexpectedEob("u64 attribute"))
    }

    /// Payload as a MAC address.
    pub fn get_mac(&self) -> Result<MacAddr, DeError> {
        MacAddr::from_slice(self.payload)
    }

    /// Payload as a NUL-terminated string.
    pub fn get_str(&self) -> Result<&'a str, DeError> {
        let bytes = match self.payload.split_last() {
            Some((&0, head)) => head,
            _ => self.payload,
        };
        std::str::from_utf8(bytes)
            .map_err(|_| DeError::InvalidValue("attribute is not valid UTF-8".into()))
    }

    /// Iterate the payload as a nested attribute block.
    pub fn nested(&self) -> AttrIter<'a> {
        AttrIter::new(self.payload)
    }
}

/// Iterator over an attribute block.
#[derive(Debug, Clone)]
pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Walk the attributes in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        AttrIter { buf }
    }

    /// Find the first attribute with the given type.
    pub fn find(&self, ty: u16) -> Result<Option<Attr<'a>>, DeError> {
        for attr in self.clone() {
            let attr = attr?;
            if attr.ty == ty {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }

    /// Find an attribute that must be present.
    pub fn require(&self, ty: u16, what: &'static str) -> Result<Attr<'a>, DeError> {
        self.find(ty)?.ok_or(DeError::MissingAttribute(what))
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>, DeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < NLA_HDRLEN {
            self.buf = &[];
            return Some(Err(DeError::UnexpectedEob("attribute header")));
        }
        let nla_len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let nla_type = u16::from_ne_bytes([self.buf[2], self.buf[3]]);
        if nla_len < NLA_HDRLEN || nla_len > self.buf.len() {
            self.buf = &[];
            return Some(Err(DeError::InvalidLength("attribute")));
        }
        let payload = &self.buf[NLA_HDRLEN..nla_len];
        self.buf = &self.buf[align(nla_len).min(self.buf.len())..];
        Some(Ok(Attr {
            ty: nla_type & NLA_TYPE_MASK,
            payload,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip_scalars() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 1, 0xab);
        put_u32(&mut buf, 2, 0xdeadbeef);
        put_u64(&mut buf, 3, 0x1122334455667788);
        put_str(&mut buf, 4, "phy0");
        put_flag(&mut buf, 5);

        let attrs = AttrIter::new(&buf);
        assert_eq!(attrs.require(1, "a").unwrap().get_u8().unwrap(), 0xab);
        assert_eq!(attrs.require(2, "b").unwrap().get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(
            attrs.require(3, "c").unwrap().get_u64().unwrap(),
            0x1122334455667788
        );
        assert_eq!(attrs.require(4, "d").unwrap().get_str().unwrap(), "phy0");
        assert!(attrs.find(5).unwrap().is_some());
        assert!(attrs.find(6).unwrap().is_none());
    }

    #[test]
    fn test_alignment_between_attributes() {
        let mut buf = Vec::new();
        put(&mut buf, 1, &[0xff]); // 5 bytes, padded to 8
        put_u32(&mut buf, 2, 7);
        assert_eq!(buf.len(), 16);
        let attrs: Vec<_> = AttrIter::new(&buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].payload, &[0xff]);
        assert_eq!(attrs[1].get_u32().unwrap(), 7);
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut buf = Vec::new();
        let outer = begin_nested(&mut buf, 10);
        put_u32(&mut buf, 1, 42);
        put_str(&mut buf, 2, "inner");
        end_nested(&mut buf, outer);

        let attrs = AttrIter::new(&buf);
        let nested = attrs.require(10, "nest").unwrap();
        let inner = nested.nested();
        assert_eq!(inner.require(1, "x").unwrap().get_u32().unwrap(), 42);
        assert_eq!(inner.require(2, "y").unwrap().get_str().unwrap(), "inner");
    }

    #[test]
    fn test_truncated_block_errors_instead_of_panicking() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1, 9);
        // Claim a length past the end of the buffer.
        buf[0] = 0xff;
        let results: Vec<_> = AttrIter::new(&buf).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_short_attribute_payload_errors() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 1, 3);
        let attr = AttrIter::new(&buf).require(1, "short").unwrap();
        assert!(attr.get_u32().is_err());
    }
}
