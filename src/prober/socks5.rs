//! SOCKS5 (RFC 1928) client handshake, no-authentication method only.
//!
//! The measured latency is the time from sending the CONNECT request to the
//! first byte of the proxy's reply; the proxy dial and method negotiation are
//! overhead and are excluded by resetting the start timestamp.
//!
//! Handshake messages are sent and received with [`send_all`] /
//! [`recv_all`], which block on the non-blocking socket until the whole
//! message has moved. While they wait, the entire probing loop waits with
//! them. Messages are at most ten bytes, so this is normally one syscall.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

use anyhow::Result;
use socket2::{Domain, SockAddr, Socket};

use super::{pending_error, start_connect, ConnState, Dial, ProbeKind, Protocol, Step};
use crate::buffer::ConnEntry;
use crate::outcome::{self, IO_ERROR};
use crate::poller::{wait_fd, Interest};
use crate::timestamp::Clock;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;

pub const GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, METHOD_NO_AUTH];

/// Reply field of the CONNECT response, indexed by status byte.
const REPLY_CODES: [u16; 9] = [
    outcome::SUCCESS,               // succeeded
    outcome::IO_ERROR,              // general SOCKS server failure
    outcome::ACCESS_DENIED,         // connection not allowed by ruleset
    outcome::NET_UNREACHABLE,       // network unreachable
    outcome::HOST_UNREACHABLE,      // host unreachable
    outcome::CONN_REFUSED,          // connection refused
    outcome::TIMED_OUT,             // TTL expired
    outcome::COMMAND_UNSUPPORTED,   // command not supported
    outcome::ADDR_TYPE_UNSUPPORTED, // address type not supported
];

/// Map a CONNECT reply status byte to a result code.
pub fn reply_code(status: u8) -> u16 {
    REPLY_CODES
        .get(usize::from(status))
        .copied()
        .unwrap_or(IO_ERROR)
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT` for an IPv4 destination.
pub fn connect_request(target: SocketAddrV4) -> [u8; 10] {
    let mut req = [0u8; 10];
    req[..4].copy_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
    req[4..8].copy_from_slice(&target.ip().octets());
    req[8..].copy_from_slice(&target.port().to_be_bytes());
    req
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    NotConnected,
    Connecting,
    SentAuth,
    SentDestination,
    Finished,
}

/// Every connection goes to `proxy`, which is asked to dial the target.
#[derive(Debug, Clone)]
pub struct Socks5 {
    proxy: SocketAddr,
    proxy_addr: SockAddr,
}

impl Socks5 {
    pub fn new(proxy: SocketAddr) -> Self {
        Self {
            proxy,
            proxy_addr: SockAddr::from(proxy),
        }
    }

    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    fn send_greeting(
        &self,
        entry: &mut ConnEntry,
        state: &mut ConnState<Phase>,
        socket: &Socket,
        clock: &Clock,
    ) -> Step {
        if send_all(socket, &GREETING).is_err() {
            return fail(entry, state, IO_ERROR, clock);
        }
        state.phase = Phase::SentAuth;
        Step::Pending(Interest::Readable)
    }

    fn send_destination(
        &self,
        entry: &mut ConnEntry,
        state: &mut ConnState<Phase>,
        socket: &Socket,
        clock: &Clock,
    ) -> Step {
        let mut reply = [0u8; 2];
        if recv_all(socket, &mut reply).is_err() {
            return fail(entry, state, IO_ERROR, clock);
        }
        match reply {
            [SOCKS_VERSION, METHOD_NO_AUTH] => {}
            [SOCKS_VERSION, METHOD_NONE_ACCEPTABLE] => {
                return fail(entry, state, outcome::ACCESS_DENIED, clock);
            }
            _ => return fail(entry, state, IO_ERROR, clock),
        }

        if send_all(socket, &connect_request(entry.target())).is_err() {
            return fail(entry, state, IO_ERROR, clock);
        }
        state.begin = clock.now();
        state.phase = Phase::SentDestination;
        Step::Pending(Interest::Readable)
    }
}

impl Protocol for Socks5 {
    type Phase = Phase;

    const KIND: ProbeKind = ProbeKind::Socks5;

    fn domain(&self) -> Domain {
        Domain::for_address(self.proxy)
    }

    fn step(
        &self,
        entry: &mut ConnEntry,
        state: &mut ConnState<Phase>,
        socket: &Socket,
        clock: &Clock,
        now: u64,
    ) -> Result<Step> {
        let step = match state.phase {
            Phase::NotConnected => {
                state.begin = now;
                match start_connect(socket, &self.proxy_addr)? {
                    Dial::InProgress => {
                        state.phase = Phase::Connecting;
                        Step::Pending(Interest::Writable)
                    }
                    Dial::Connected => self.send_greeting(entry, state, socket, clock),
                    Dial::Failed(code) => fail(entry, state, code, clock),
                }
            }
            Phase::Connecting => match pending_error(socket)? {
                outcome::SUCCESS => self.send_greeting(entry, state, socket, clock),
                code => fail(entry, state, code, clock),
            },
            Phase::SentAuth => self.send_destination(entry, state, socket, clock),
            Phase::SentDestination => {
                // The reply has started to arrive: that is the measurement.
                let elapsed = now.saturating_sub(state.begin);
                state.phase = Phase::Finished;

                let mut reply = [0u8; 2];
                let code = match recv_all(socket, &mut reply) {
                    Err(_) => IO_ERROR,
                    Ok(()) if reply[0] != SOCKS_VERSION => IO_ERROR,
                    Ok(()) => reply_code(reply[1]),
                };
                // BND.ADDR and BND.PORT are left unread.
                entry.finish(code, elapsed);
                Step::Finished
            }
            Phase::Finished => Step::Finished,
        };
        Ok(step)
    }
}

fn fail(entry: &mut ConnEntry, state: &mut ConnState<Phase>, code: u16, clock: &Clock) -> Step {
    entry.finish(code, clock.now().saturating_sub(state.begin));
    state.phase = Phase::Finished;
    Step::Finished
}

/// Send all of `buf`, waiting out `EWOULDBLOCK`. A zero-length write counts as
/// a disconnect.
pub(crate) fn send_all(socket: &Socket, buf: &[u8]) -> io::Result<()> {
    let mut sock = socket;
    let mut sent = 0;
    while sent < buf.len() {
        match sock.write(&buf[sent..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_fd(socket.as_raw_fd(), Interest::Writable)?
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill all of `buf`, waiting out `EWOULDBLOCK`. End of stream before the
/// buffer is full is an error.
pub(crate) fn recv_all(socket: &Socket, buf: &mut [u8]) -> io::Result<()> {
    let mut sock = socket;
    let mut got = 0;
    while got < buf.len() {
        match sock.read(&mut buf[got..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_fd(socket.as_raw_fd(), Interest::Readable)?
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
