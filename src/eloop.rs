//! Readiness dispatch for the scheduler thread.
//!
//! A thin epoll wrapper: file descriptors register with a caller
//! token, and `wait` reports which tokens fired. A timerfd paces the
//! virtual clock against the wall clock in live mode and an eventfd
//! carries cross-thread wakeups from the RPC bridge; both are plain
//! descriptors registered like any other.

use std::{io, mem, os::unix::io::RawFd, time::Duration};

use crate::err::SockError;

/// Token identifying one registered descriptor.
pub type Token = u64;

/// Epoll instance dispatching by token.
pub struct EventLoop {
    epfd: RawFd,
}

impl EventLoop {
    /// Create the epoll instance.
    pub fn new() -> Result<Self, SockError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(EventLoop { epfd })
    }

    /// Watch `fd` for readability under `token`.
    pub fn register(&self, fd: RawFd, token: Token) -> Result<(), SockError> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn unregister(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Block until readiness or timeout; returns fired tokens.
    /// `None` blocks indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Token>, SockError> {
        let mut events: [libc::epoll_event; 32] = unsafe { mem::zeroed() };
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(SockError::Io(err));
            }
        };
        Ok(events[..n as usize].iter().map(|e| e.u64).collect())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

/// A monotonic-clock timerfd used to pace live mode.
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    /// Create a non-armed monotonic timer.
    pub fn new() -> Result<Self, SockError> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(TimerFd { fd })
    }

    /// Raw descriptor for registration.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Arm a one-shot expiry `delay` from now. A zero delay fires
    /// immediately (rounded up to one nanosecond; zero disarms).
    pub fn arm(&self, delay: Duration) -> Result<(), SockError> {
        let delay_ns = delay.as_nanos().max(1) as i64;
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay_ns / 1_000_000_000,
                tv_nsec: delay_ns % 1_000_000_000,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Consume an expiry notification.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The eventfd the RPC thread pokes to wake the scheduler loop.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a fresh eventfd.
    pub fn new() -> Result<Self, SockError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(EventFd { fd })
    }

    /// Raw descriptor for registration.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Post one wakeup. Never writes zero, which would not wake the
    /// reader.
    pub fn signal(&self) {
        let value: u64 = 1;
        unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            );
        }
    }

    /// Clear pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_eventfd_wakes_epoll() {
        let eloop = EventLoop::new().unwrap();
        let event = EventFd::new().unwrap();
        eloop.register(event.as_raw_fd(), 7).unwrap();

        // Nothing pending: a zero timeout returns empty.
        let tokens = eloop.wait(Some(Duration::from_millis(0))).unwrap();
        assert!(tokens.is_empty());

        event.signal();
        let tokens = eloop.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(tokens, vec![7]);
        event.drain();
        let tokens = eloop.wait(Some(Duration::from_millis(0))).unwrap();
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_timerfd_fires_after_delay() {
        let eloop = EventLoop::new().unwrap();
        let timer = TimerFd::new().unwrap();
        eloop.register(timer.as_raw_fd(), 3).unwrap();
        timer.arm(Duration::from_millis(5)).unwrap();
        let tokens = eloop.wait(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(tokens, vec![3]);
        timer.drain();
    }
}
