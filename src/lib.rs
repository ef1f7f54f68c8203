//! TCP dial-time measurement engine: a single-threaded poll loop that opens
//! non-blocking connections to many IPv4 targets, directly or through a
//! SOCKS5 proxy, under spacing, concurrency and timeout limits, and records a
//! result code and elapsed nanoseconds for each.
pub mod buffer;
pub mod config;
pub mod metrics;
pub mod outcome;
pub mod poller;
pub mod prober;
pub mod scheduler;
pub mod textio;
pub mod timestamp;
pub mod util;
