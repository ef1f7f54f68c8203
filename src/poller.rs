//! Thin wrapper over `ppoll(2)` / `poll(2)`.
//!
//! The scheduler keeps one [`Poller`] holding every active descriptor; the
//! SOCKS5 helpers use [`wait_fd`] for their nested single-descriptor waits.

use std::io;
use std::os::fd::RawFd;

use libc::{nfds_t, pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

use crate::timestamp::NANOS_PER_SEC;

/// Readiness a protocol step asks to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => POLLIN,
            Interest::Writable => POLLOUT,
        }
    }
}

#[derive(Default)]
pub struct Poller {
    fds: Vec<pollfd>,
}

impl Poller {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) {
        self.fds.push(pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
    }

    pub fn fd(&self, slot: usize) -> RawFd {
        self.fds[slot].fd
    }

    /// True when the last wait reported anything at all for this slot,
    /// including error and hangup conditions.
    pub fn is_active(&self, slot: usize) -> bool {
        self.fds[slot].revents != 0
    }

    pub fn reregister(&mut self, slot: usize, interest: Interest) {
        let p = &mut self.fds[slot];
        p.events = interest.events();
        p.revents = 0;
    }

    /// Remove a slot by moving the last one into its place.
    pub fn swap_remove(&mut self, slot: usize) -> RawFd {
        self.fds.swap_remove(slot).fd
    }

    /// Block until at least one descriptor is ready or `timeout_ns` elapses.
    /// With no descriptors registered this is a plain sleep.
    pub fn wait(&mut self, timeout_ns: u64) -> io::Result<usize> {
        for p in self.fds.iter_mut() {
            p.revents = 0;
        }
        loop {
            match sys_poll(&mut self.fds, Some(timeout_ns)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Wait with no timeout until `fd` is ready for `interest` or reports an
/// error/hangup. The caller finds out which by retrying its I/O.
pub fn wait_fd(fd: RawFd, interest: Interest) -> io::Result<()> {
    let mut one = [pollfd {
        fd,
        events: interest.events(),
        revents: 0,
    }];
    loop {
        match sys_poll(&mut one, None) {
            Ok(_) if one[0].revents & libc::POLLNVAL != 0 => {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            Ok(_) if one[0].revents & (interest.events() | POLLERR | POLLHUP) != 0 => {
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn sys_poll(fds: &mut [pollfd], timeout_ns: Option<u64>) -> io::Result<usize> {
    let ts = timeout_ns.map(|ns| {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = (ns / NANOS_PER_SEC) as libc::time_t;
        ts.tv_nsec = (ns % NANOS_PER_SEC) as _;
        ts
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);
    let rc = unsafe {
        libc::ppoll(
            fds.as_mut_ptr(),
            fds.len() as nfds_t,
            ts_ptr,
            std::ptr::null(),
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn sys_poll(fds: &mut [pollfd], timeout_ns: Option<u64>) -> io::Result<usize> {
    // poll() only has millisecond resolution; round up so deadlines are not
    // reported early.
    let timeout_ms = match timeout_ns {
        Some(ns) => ns.div_ceil(1_000_000).min(libc::c_int::MAX as u64) as libc::c_int,
        None => -1,
    };
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn empty_wait_sleeps_for_the_timeout() {
        let mut poller = Poller::default();
        let start = Instant::now();
        assert_eq!(poller.wait(20_000_000).unwrap(), 0);
        assert!(start.elapsed().as_millis() >= 15);
    }

    #[test]
    fn reports_readable_and_writable_slots() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::with_capacity(2);
        poller.register(b.as_raw_fd(), Interest::Readable);
        poller.register(a.as_raw_fd(), Interest::Writable);

        // a is writable right away, b has nothing to read yet
        assert_eq!(poller.wait(NANOS_PER_SEC).unwrap(), 1);
        assert!(!poller.is_active(0));
        assert!(poller.is_active(1));

        a.write_all(b"x").unwrap();
        assert_eq!(poller.swap_remove(1), a.as_raw_fd());
        assert_eq!(poller.wait(NANOS_PER_SEC).unwrap(), 1);
        assert!(poller.is_active(0));
        assert_eq!(poller.fd(0), b.as_raw_fd());
    }

    #[test]
    fn wait_fd_returns_on_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        wait_fd(b.as_raw_fd(), Interest::Readable).unwrap();
    }
}
