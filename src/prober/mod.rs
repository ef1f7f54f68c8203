use std::fmt;
use std::io;

use anyhow::{Context, Result};
use socket2::{Domain, SockAddr, Socket};

use crate::buffer::ConnEntry;
use crate::outcome;
use crate::poller::Interest;
use crate::timestamp::Clock;

pub mod socks5;
pub mod tcp_connect;

/// The closed set of connection-establishment protocols, chosen once at
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Direct,
    Socks5,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Direct => f.write_str("direct"),
            ProbeKind::Socks5 => f.write_str("socks5"),
        }
    }
}

/// What a protocol step wants from the scheduler next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Still in flight: wake me when the socket is ready for this.
    Pending(Interest),
    /// Result and elapsed time are recorded; the socket can be closed.
    Finished,
}

/// Per-connection state owned by the scheduler while the socket is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnState<P> {
    /// Timestamp the measurement runs from.
    pub begin: u64,
    pub phase: P,
}

pub trait Protocol {
    type Phase: Default + Copy + fmt::Debug;

    const KIND: ProbeKind;

    /// Address family of the sockets the scheduler should open.
    fn domain(&self) -> Domain;

    /// Advance one connection by one step. `now` is the scheduler's view of
    /// the current time; `clock` is for re-reading it after slow calls.
    ///
    /// Errors are process-fatal. Per-connection failures are recorded in
    /// `entry` and reported as [`Step::Finished`].
    fn step(
        &self,
        entry: &mut ConnEntry,
        state: &mut ConnState<Self::Phase>,
        socket: &Socket,
        clock: &Clock,
        now: u64,
    ) -> Result<Step>;
}

/// Result of issuing a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dial {
    Connected,
    InProgress,
    Failed(u16),
}

pub(crate) fn start_connect(socket: &Socket, addr: &SockAddr) -> Result<Dial> {
    match socket.connect(addr) {
        Ok(()) => Ok(Dial::Connected),
        Err(e) => match e.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(Dial::InProgress),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
            | Some(libc::ENOMEM) => Err(e).context("connect"),
            _ => Ok(Dial::Failed(outcome::from_io_error(&e))),
        },
    }
}

/// SO_ERROR of a socket whose connect has resolved.
pub(crate) fn pending_error(socket: &Socket) -> Result<u16> {
    let err: Option<io::Error> = socket.take_error().context("getsockopt(SO_ERROR)")?;
    Ok(err.as_ref().map_or(outcome::SUCCESS, outcome::from_io_error))
}
