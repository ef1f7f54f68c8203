//! Connection record store.
//!
//! The shared layout is 16 header bytes followed by `n_conns` 16-byte
//! entries:
//!
//! ```text
//! header: n_conns u32 | n_processed u32 | spacing_ns u32 | timeout_ns u32   (native order)
//! entry:  ipv4 u32 (network) | port u16 (network) | result u16 (native) | elapsed_ns u64 (native)
//! ```
//!
//! Fields are encoded and decoded one by one; nothing relies on struct layout.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{Deref, DerefMut};
use std::os::fd::{FromRawFd, RawFd};

use anyhow::{Context, Result};
use memmap2::MmapMut;
use thiserror::Error;

use crate::outcome::NOT_ATTEMPTED;

pub const HEADER_LEN: usize = 16;
pub const ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("connection buffer is too short: {len} bytes (header alone is 16)")]
    TooShort { len: usize },
    #[error("connection buffer is the wrong size: {len} (expected {expected}={n_conns}*16+16)")]
    WrongSize {
        len: usize,
        expected: usize,
        n_conns: u32,
    },
    #[error("connection buffer has a zero timeout")]
    ZeroTimeout,
}

/// One target and, once resolved, its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnEntry {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub result: u16,
    pub elapsed_ns: u64,
}

impl ConnEntry {
    pub fn new(target: SocketAddrV4) -> Self {
        Self {
            addr: *target.ip(),
            port: target.port(),
            result: NOT_ATTEMPTED,
            elapsed_ns: 0,
        }
    }

    pub fn target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }

    pub fn is_done(&self) -> bool {
        self.elapsed_ns != 0
    }

    /// Record the outcome. Elapsed doubles as the "processed" marker, so a
    /// zero measurement is stored as 1ns.
    pub fn finish(&mut self, result: u16, elapsed_ns: u64) {
        self.result = result;
        self.elapsed_ns = elapsed_ns.max(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Minimum time between two connection starts.
    pub spacing_ns: u64,
    /// Maximum time a connection attempt may stay unresolved.
    pub timeout_ns: u64,
}

/// What the scheduler needs from a table of connections.
pub trait ConnStore {
    fn run_config(&self) -> RunConfig;
    fn len(&self) -> usize;
    fn entry(&self, idx: usize) -> ConnEntry;
    /// Write back the result fields of `entry`. Target fields are never
    /// modified.
    fn store_result(&mut self, idx: usize, entry: &ConnEntry);
    fn processed(&self) -> usize;
    fn set_processed(&mut self, n: usize);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries whose elapsed field is already set.
    fn completed(&self) -> usize {
        (0..self.len()).filter(|&i| self.entry(i).is_done()).count()
    }
}

/// The bit-exact shared layout over any mutable byte region.
pub struct ConnBuffer<B> {
    bytes: B,
    n_conns: usize,
}

impl<B> ConnBuffer<B>
where
    B: Deref<Target = [u8]> + DerefMut,
{
    pub fn new(bytes: B) -> Result<Self, BufferError> {
        let len = bytes.len();
        if len < HEADER_LEN {
            return Err(BufferError::TooShort { len });
        }
        let n_conns = read_u32(&bytes, 0);
        let expected = (n_conns as usize)
            .checked_mul(ENTRY_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected != Some(len) {
            return Err(BufferError::WrongSize {
                len,
                expected: expected.unwrap_or(usize::MAX),
                n_conns,
            });
        }
        if read_u32(&bytes, 12) == 0 {
            return Err(BufferError::ZeroTimeout);
        }
        Ok(Self {
            bytes,
            n_conns: n_conns as usize,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_inner(self) -> B {
        self.bytes
    }

    fn entry_offset(&self, idx: usize) -> usize {
        assert!(idx < self.n_conns, "entry {} out of range", idx);
        HEADER_LEN + idx * ENTRY_LEN
    }
}

impl ConnBuffer<Vec<u8>> {
    /// Lay out a fresh in-memory buffer, e.g. for tests or for handing to a
    /// child process.
    pub fn build(
        spacing_ns: u32,
        timeout_ns: u32,
        targets: &[SocketAddrV4],
    ) -> Result<Self, BufferError> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + targets.len() * ENTRY_LEN);
        bytes.extend_from_slice(&(targets.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&spacing_ns.to_ne_bytes());
        bytes.extend_from_slice(&timeout_ns.to_ne_bytes());
        for t in targets {
            bytes.extend_from_slice(&t.ip().octets());
            bytes.extend_from_slice(&t.port().to_be_bytes());
            bytes.extend_from_slice(&NOT_ATTEMPTED.to_ne_bytes());
            bytes.extend_from_slice(&0u64.to_ne_bytes());
        }
        Self::new(bytes)
    }
}

impl<B> ConnStore for ConnBuffer<B>
where
    B: Deref<Target = [u8]> + DerefMut,
{
    fn run_config(&self) -> RunConfig {
        RunConfig {
            spacing_ns: u64::from(read_u32(&self.bytes, 8)),
            timeout_ns: u64::from(read_u32(&self.bytes, 12)),
        }
    }

    fn len(&self) -> usize {
        self.n_conns
    }

    fn entry(&self, idx: usize) -> ConnEntry {
        let off = self.entry_offset(idx);
        let b = &self.bytes[off..off + ENTRY_LEN];
        ConnEntry {
            addr: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            port: u16::from_be_bytes([b[4], b[5]]),
            result: u16::from_ne_bytes([b[6], b[7]]),
            elapsed_ns: read_u64(b, 8),
        }
    }

    fn store_result(&mut self, idx: usize, entry: &ConnEntry) {
        let off = self.entry_offset(idx);
        let b = &mut self.bytes[off..off + ENTRY_LEN];
        b[6..8].copy_from_slice(&entry.result.to_ne_bytes());
        b[8..16].copy_from_slice(&entry.elapsed_ns.to_ne_bytes());
    }

    fn processed(&self) -> usize {
        read_u32(&self.bytes, 4) as usize
    }

    fn set_processed(&mut self, n: usize) {
        self.bytes[4..8].copy_from_slice(&(n as u32).to_ne_bytes());
    }
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[off..off + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_ne_bytes(raw)
}

/// A [`ConnBuffer`] mapped shared from a descriptor inherited from the
/// orchestrator. Every result is visible to the parent the moment it is
/// written, so a crash leaves finished entries in place.
pub struct SharedBuffer {
    buf: ConnBuffer<MmapMut>,
    // keeps the descriptor number occupied for the lifetime of the mapping
    _file: File,
}

impl SharedBuffer {
    /// Take ownership of `fd` and map it.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let file = unsafe { File::from_raw_fd(fd) };
        Self::from_file(file).with_context(|| format!("connection buffer on fd {}", fd))
    }

    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata().context("fstat")?.len();
        let len = usize::try_from(len)
            .map_err(|_| anyhow::anyhow!("connection buffer is too big to map into memory"))?;
        if len < HEADER_LEN {
            return Err(BufferError::TooShort { len }.into());
        }
        let map = unsafe { MmapMut::map_mut(&file) }.context("mmap")?;
        let buf = ConnBuffer::new(map)?;
        Ok(Self { buf, _file: file })
    }

    pub fn flush(&self) -> Result<()> {
        self.buf.bytes.flush().context("msync")
    }
}

impl Deref for SharedBuffer {
    type Target = ConnBuffer<MmapMut>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for SharedBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

/// Plain in-memory table used by the line-oriented stream adapter, whose
/// spacing and timeout do not have to fit the shared header's 32-bit fields.
#[derive(Debug, Clone)]
pub struct ConnList {
    entries: Vec<ConnEntry>,
    config: RunConfig,
    processed: usize,
}

impl ConnList {
    pub fn new(config: RunConfig, targets: &[SocketAddrV4]) -> Self {
        Self {
            entries: targets.iter().copied().map(ConnEntry::new).collect(),
            config,
            processed: 0,
        }
    }

    pub fn entries(&self) -> &[ConnEntry] {
        &self.entries
    }
}

impl ConnStore for ConnList {
    fn run_config(&self) -> RunConfig {
        self.config
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, idx: usize) -> ConnEntry {
        self.entries[idx]
    }

    fn store_result(&mut self, idx: usize, entry: &ConnEntry) {
        let e = &mut self.entries[idx];
        e.result = entry.result;
        e.elapsed_ns = entry.elapsed_ns;
    }

    fn processed(&self) -> usize {
        self.processed
    }

    fn set_processed(&mut self, n: usize) {
        self.processed = n;
    }
}
