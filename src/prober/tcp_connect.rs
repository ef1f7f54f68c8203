use std::net::SocketAddr;

use anyhow::Result;
use socket2::{Domain, SockAddr, Socket};

use super::{pending_error, start_connect, ConnState, Dial, ProbeKind, Protocol, Step};
use crate::buffer::ConnEntry;
use crate::outcome;
use crate::poller::Interest;
use crate::timestamp::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    NotConnected,
    Connecting,
    Finished,
}

/// Plain TCP connect to the target itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Protocol for Direct {
    type Phase = Phase;

    const KIND: ProbeKind = ProbeKind::Direct;

    fn domain(&self) -> Domain {
        Domain::IPV4
    }

    fn step(
        &self,
        entry: &mut ConnEntry,
        state: &mut ConnState<Phase>,
        socket: &Socket,
        clock: &Clock,
        now: u64,
    ) -> Result<Step> {
        match state.phase {
            Phase::NotConnected => {
                state.begin = now;
                let addr = SockAddr::from(SocketAddr::V4(entry.target()));
                let code = match start_connect(socket, &addr)? {
                    Dial::InProgress => {
                        state.phase = Phase::Connecting;
                        return Ok(Step::Pending(Interest::Writable));
                    }
                    Dial::Connected => outcome::SUCCESS,
                    Dial::Failed(code) => code,
                };
                // resolved synchronously; the error is in hand before the
                // clock is read again
                finish(entry, state, code, clock.now());
                Ok(Step::Finished)
            }
            Phase::Connecting => {
                let code = pending_error(socket)?;
                finish(entry, state, code, now);
                Ok(Step::Finished)
            }
            Phase::Finished => Ok(Step::Finished),
        }
    }
}

fn finish(entry: &mut ConnEntry, state: &mut ConnState<Phase>, code: u16, end: u64) {
    entry.finish(code, end.saturating_sub(state.begin));
    state.phase = Phase::Finished;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use socket2::{Protocol as SockProtocol, Type};

    fn nonblocking_socket() -> Socket {
        let s = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP)).unwrap();
        s.set_nonblocking(true).unwrap();
        s
    }

    fn drive(entry: &mut ConnEntry) -> ConnState<Phase> {
        let clock = Clock::new();
        let socket = nonblocking_socket();
        let mut state = ConnState::<Phase>::default();
        let mut step = Direct
            .step(entry, &mut state, &socket, &clock, clock.now())
            .unwrap();
        while let Step::Pending(interest) = step {
            assert_eq!(interest, Interest::Writable);
            crate::poller::wait_fd(std::os::fd::AsRawFd::as_raw_fd(&socket), interest).unwrap();
            step = Direct
                .step(entry, &mut state, &socket, &clock, clock.now())
                .unwrap();
        }
        state
    }

    #[test]
    fn connects_to_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut entry = ConnEntry::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let state = drive(&mut entry);
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(entry.result, outcome::SUCCESS);
        assert!(entry.is_done());
    }

    #[test]
    fn closed_port_is_refused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut entry = ConnEntry::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        drive(&mut entry);
        assert_eq!(entry.result, outcome::CONN_REFUSED);
        assert!(entry.is_done());
    }

    #[test]
    fn finished_is_terminal() {
        let clock = Clock::new();
        let socket = nonblocking_socket();
        let mut entry = ConnEntry::new("127.0.0.1:9".parse().unwrap());
        let mut state = ConnState {
            begin: 0,
            phase: Phase::Finished,
        };
        let step = Direct.step(&mut entry, &mut state, &socket, &clock, 5).unwrap();
        assert_eq!(step, Step::Finished);
        assert!(!entry.is_done());
    }
}
