//! Line-oriented adapter: `ipv4 port` lines in, `ipv4 port errno seconds`
//! lines out, in input order.

use std::io::{BufRead, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{anyhow, Context, Result};

use crate::buffer::ConnEntry;
use crate::timestamp::format_decimal_seconds;

/// Parse the target list. Blank lines are skipped; anything else that is not
/// exactly an IPv4 address and a port in 1..=65535 is an error quoting the
/// line.
pub fn read_targets<R: BufRead>(input: R) -> Result<Vec<SocketAddrV4>> {
    let mut targets = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.context("reading targets")?;
        if line.trim().is_empty() {
            continue;
        }
        targets.push(
            parse_target(&line).with_context(|| format!("line {}: '{}'", lineno + 1, line))?,
        );
    }
    Ok(targets)
}

fn parse_target(line: &str) -> Result<SocketAddrV4> {
    let mut fields = line.split_whitespace();
    let addr = fields
        .next()
        .ok_or_else(|| anyhow!("incomplete input line (looking for addr)"))?;
    let port = fields
        .next()
        .ok_or_else(|| anyhow!("incomplete input line (looking for port)"))?;
    if fields.next().is_some() {
        return Err(anyhow!("trailing garbage after port"));
    }
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| anyhow!("invalid IPv4 address: '{}'", addr))?;
    let port: u16 = match port.parse() {
        Ok(p) if p >= 1 => p,
        _ => return Err(anyhow!("invalid TCP port number: '{}'", port)),
    };
    Ok(SocketAddrV4::new(addr, port))
}

pub fn write_results<W: Write>(mut out: W, entries: &[ConnEntry]) -> Result<()> {
    for e in entries {
        writeln!(
            out,
            "{} {} {} {}",
            e.addr,
            e.port,
            e.result,
            format_decimal_seconds(e.elapsed_ns)
        )?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targets_in_order() {
        let input = "192.0.2.1 80\n\n10.0.0.7   443\n";
        let targets = read_targets(input.as_bytes()).unwrap();
        assert_eq!(
            targets,
            vec![
                "192.0.2.1:80".parse::<SocketAddrV4>().unwrap(),
                "10.0.0.7:443".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn rejects_bad_lines() {
        for bad in ["192.0.2.1\n", "192.0.2.1 0\n", "192.0.2.1 70000\n", "::1 80\n", "1.2.3.4 80 x\n"] {
            let err = read_targets(bad.as_bytes()).unwrap_err();
            assert!(format!("{:#}", err).contains("line 1"), "{}", bad);
        }
    }

    #[test]
    fn writes_one_line_per_entry() {
        let mut ok = ConnEntry::new("192.0.2.1:80".parse().unwrap());
        ok.finish(0, 1_500_000);
        let mut refused = ConnEntry::new("192.0.2.2:81".parse().unwrap());
        refused.finish(libc::ECONNREFUSED as u16, 2_000);

        let mut out = Vec::new();
        write_results(&mut out, &[ok, refused]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("192.0.2.1 80 0 0.001500\n192.0.2.2 81 {} 0.000002\n", libc::ECONNREFUSED)
        );
    }
}
