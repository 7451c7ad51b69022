//! Hand-rolled netlink wire handling.
//!
//! This is deliberately a small, daemon-shaped subset of a netlink
//! library: native-endian framing for `nlmsghdr`/`genlmsghdr`, an
//! attribute writer and iterator with nesting, a raw
//! `NETLINK_GENERIC` socket, and `CTRL_CMD_GETFAMILY` resolution.
//!
//! # Design decisions
//! Attribute payloads are handed out as borrowed byte slices and
//! converted by typed accessors that return [`DeError`] instead of
//! panicking; a malformed attribute block from the kernel must never
//! take the loop down.

pub mod attr;
pub mod ctrl;
pub mod msg;
pub mod sock;

/// Round a length up to the 4-byte netlink alignment.
pub fn align(len: usize) -> usize {
    (len + 3) & !3
}
