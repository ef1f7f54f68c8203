// Process-level helpers: descriptor limits, descriptor cleanup, host/port parsing.

use std::ffi::CString;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;

use anyhow::{bail, Context, Result};

/// Soft RLIMIT_NOFILE, capped to what a descriptor number can hold.
pub fn fd_limit() -> Result<u64> {
    let mut rl: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error()).context("getrlimit");
    }
    Ok((rl.rlim_cur as u64).min(i32::MAX as u64))
}

/// Close every descriptor above stderr except those in `keep`, in case the
/// parent leaked some into us. Enumerates /proc/self/fd where available and
/// otherwise walks the whole descriptor range.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<usize> {
    let limit = fd_limit()?;
    let candidates: Vec<RawFd> = match fs::read_dir("/proc/self/fd") {
        Ok(dir) => dir
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => (3..limit as RawFd).collect(),
    };
    let mut closed = 0;
    for fd in candidates {
        if fd < 3 || keep.contains(&fd) {
            continue;
        }
        // EBADF is expected for the directory handle used above
        if unsafe { libc::close(fd) } == 0 {
            closed += 1;
        }
    }
    Ok(closed)
}

/// Split `host:port`, falling back to `default_port` when there is no port.
/// Brackets around IPv6 literals are removed.
pub fn parse_host_port(s: &str, default_port: u16) -> (String, u16) {
    let (host, port) = match s.rfind(':') {
        Some(idx) if !s[..idx].contains(':') || s[..idx].ends_with(']') => {
            match s[idx + 1..].parse::<u16>() {
                Ok(port) => (&s[..idx], port),
                Err(_) => (s, default_port),
            }
        }
        _ => (s, default_port),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    (host.to_string(), port)
}

/// A port number or a TCP service name from the services database, the way
/// getaddrinfo takes its service argument.
pub fn resolve_port(port: &str) -> Result<u16> {
    if let Ok(p) = port.parse::<u16>() {
        return Ok(p);
    }
    let name = CString::new(port).with_context(|| format!("invalid service name '{}'", port))?;
    // Only called during startup, before anything else could touch the
    // services database.
    let ent = unsafe { libc::getservbyname(name.as_ptr(), c"tcp".as_ptr()) };
    if ent.is_null() {
        bail!("unknown TCP service '{}'", port);
    }
    // s_port holds the port in network order in its low 16 bits
    let raw = unsafe { (*ent).s_port };
    Ok(u16::from_be(raw as u16))
}

/// Resolve a host name or literal with the system resolver; the first
/// address wins.
pub fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr> {
    // First try to parse as IP address
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("error resolving address '{}:{}'", host, port))?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("Could not resolve hostname: {}", host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splitting() {
        assert_eq!(parse_host_port("proxy.local:9050", 1080), ("proxy.local".to_string(), 9050));
        assert_eq!(parse_host_port("proxy.local", 1080), ("proxy.local".to_string(), 1080));
        assert_eq!(parse_host_port("[::1]:9050", 1080), ("::1".to_string(), 9050));
        assert_eq!(parse_host_port("::1", 1080), ("::1".to_string(), 1080));
        assert_eq!(parse_host_port("host:notaport", 1080), ("host:notaport".to_string(), 1080));
    }

    #[test]
    fn resolves_literals_and_localhost() {
        assert_eq!(
            resolve_host_port("127.0.0.1", 1080).unwrap(),
            "127.0.0.1:1080".parse().unwrap()
        );
        let addr = resolve_host_port("localhost", 1080).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1080);
    }

    #[test]
    fn ports_accept_numbers_and_reject_unknown_services() {
        assert_eq!(resolve_port("1080").unwrap(), 1080);
        assert_eq!(resolve_port("65535").unwrap(), 65535);
        assert!(resolve_port("no-such-service-dial-probe").is_err());
        assert!(resolve_port("bad\0name").is_err());
        assert!(resolve_port("").is_err());
    }

    #[test]
    fn service_names_match_the_services_database() {
        // /etc/services is not present in every minimal container
        let Ok(services) = fs::read_to_string("/etc/services") else {
            return;
        };
        let has_http = services.lines().any(|l| {
            let mut f = l.split_whitespace();
            f.next() == Some("http") && f.next() == Some("80/tcp")
        });
        if has_http {
            assert_eq!(resolve_port("http").unwrap(), 80);
        }
    }

    #[test]
    fn fd_limit_leaves_room_for_stdio() {
        assert!(fd_limit().unwrap() > 3);
    }
}
