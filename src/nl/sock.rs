//! The raw `NETLINK_GENERIC` socket.
//!
//! Thin, blocking wrapper over the libc socket calls; readiness is the
//! event loop's job, so the only sophistication here is multicast
//! group membership and a sequence counter for request correlation.

use std::{
    cell::Cell,
    io,
    mem,
    os::unix::io::{AsRawFd, RawFd},
};

use log::trace;

use crate::err::SockError;

/// Receive buffer sized for the largest frame the driver forwards
/// plus netlink overhead.
pub const RECV_BUF_LEN: usize = 32768;

/// A bound generic netlink socket.
pub struct NlSock {
    fd: RawFd,
    pid: u32,
    seq: Cell<u32>,
}

impl NlSock {
    /// Open and bind a `NETLINK_GENERIC` socket, letting the kernel
    /// assign the port id.
    pub fn connect() -> Result<Self, SockError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(SockError::Io(err));
        }

        // Read back the kernel-assigned pid.
        let mut bound: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                fd,
                &mut bound as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(SockError::Io(err));
        }

        Ok(NlSock {
            fd,
            pid: bound.nl_pid,
            seq: Cell::new(1),
        })
    }

    /// The kernel-assigned port id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next sequence number for a request.
    pub fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    /// Join a generic netlink multicast group.
    pub fn add_membership(&self, group: u32) -> Result<(), SockError> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                &group as *const u32 as *const libc::c_void,
                mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(SockError::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    /// Send one assembled message to the kernel.
    pub fn send(&self, msg: &[u8]) -> Result<(), SockError> {
        trace!("netlink send: {} bytes", msg.len());
        let ret = unsafe {
            libc::send(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            Err(SockError::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    /// Receive one datagram into `buf`, returning the byte count.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SockError> {
        let ret = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        trace!("netlink recv: {ret} bytes");
        Ok(ret as usize)
    }
}

impl AsRawFd for NlSock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NlSock {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
