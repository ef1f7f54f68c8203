use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Protocol as SockProtocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::buffer::{ConnEntry, ConnStore, RunConfig};
use crate::metrics::RunMetrics;
use crate::outcome;
use crate::poller::Poller;
use crate::prober::{ConnState, ProbeKind, Protocol, Step};
use crate::timestamp::{format_elapsed, Clock};
use crate::util::fd_limit;

/// Descriptors that are not available to probe sockets: the shared buffer
/// (stdin), stdout and stderr.
pub const RESERVED_FDS: u64 = 3;

/// Log target for periodic progress lines. The log filter keeps it at
/// `info` whatever level the rest of the crate runs at.
pub const PROGRESS_TARGET: &str = "dial_probe::progress";

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// What a run did, for logging and tests. The results themselves are in the
/// store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    /// Entries already resolved before this run began.
    pub skipped: usize,
    pub started: usize,
    pub peak_in_flight: usize,
    pub wall_ns: u64,
}

/// An open socket and the connection it belongs to.
struct Slot<P> {
    index: usize,
    socket: Socket,
    state: ConnState<P>,
}

pub struct Scheduler {
    max_concurrency: usize,
    fd_limit: u64,
    progress_interval: Duration,
    clock: Clock,
    metrics: RunMetrics,
}

impl Scheduler {
    /// `max_concurrency` defaults to every descriptor the process may open
    /// beyond the reserved ones.
    pub fn new(max_concurrency: Option<usize>) -> Result<Self> {
        let fd_limit = fd_limit()?;
        let ceiling = fd_limit.saturating_sub(RESERVED_FDS) as usize;
        let max_concurrency = match max_concurrency {
            None if ceiling >= 1 => ceiling,
            None => bail!("open file limit {} leaves no room for sockets", fd_limit),
            Some(n) if (1..=ceiling).contains(&n) => n,
            Some(n) => bail!(
                "max concurrency {}: must be between 1 and {} (open file limit {})",
                n,
                ceiling,
                fd_limit
            ),
        };
        Ok(Self {
            max_concurrency,
            fd_limit,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            clock: Clock::new(),
            metrics: RunMetrics::new()?,
        })
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Probe every unresolved entry of `store` with `proto`, writing each
    /// result back in place as it resolves.
    ///
    /// Starts follow store order, at most one per `spacing` and never more
    /// than `max_concurrency` in flight. Returns once nothing is unstarted or
    /// pending. An error means the process cannot continue; results already
    /// written stay valid.
    pub fn run<S, P>(&self, store: &mut S, proto: &P) -> Result<RunSummary>
    where
        S: ConnStore + ?Sized,
        P: Protocol,
    {
        let cfg = store.run_config();
        let total = store.len();
        reconcile_processed(store);

        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        if store.processed() >= total {
            info!(total, "no connections left to probe");
            return Ok(summary);
        }
        debug!(
            protocol = %P::KIND,
            total,
            done = store.processed(),
            spacing_ns = cfg.spacing_ns,
            timeout_ns = cfg.timeout_ns,
            max_concurrency = self.max_concurrency,
            "starting probe run"
        );

        let capacity = self.max_concurrency.min(total);
        let mut poller = Poller::with_capacity(capacity);
        let mut slots: HashMap<RawFd, Slot<P::Phase>> = HashMap::with_capacity(capacity);
        let mut next = 0usize;
        let mut last_start: Option<u64> = None;
        let mut last_report: Option<u64> = None;
        let run_start = self.clock.now();
        let progress_ns = self.progress_interval.as_nanos() as u64;

        loop {
            while next < total && store.entry(next).is_done() {
                next += 1;
                summary.skipped += 1;
            }
            if next >= total && poller.is_empty() {
                break;
            }

            let now = self.clock.now();
            if last_report.is_none_or(|t| now.saturating_sub(t) >= progress_ns) {
                progress_report(now - run_start, total, store.processed(), poller.len());
                last_report = Some(now);
            }

            if next < total
                && poller.len() < self.max_concurrency
                && spacing_elapsed(last_start, now, cfg.spacing_ns)
            {
                let now = self.clock.now();
                last_start = Some(now);
                self.start(store, proto, next, now, &mut poller, &mut slots)?;
                next += 1;
                summary.started += 1;
                summary.peak_in_flight = summary.peak_in_flight.max(poller.len());
            }

            let can_start = next < total && poller.len() < self.max_concurrency;
            let ceiling = wait_ceiling(
                &cfg,
                self.clock.now(),
                slots.values().map(|s| s.state.begin),
                can_start.then_some(last_start).flatten(),
            );
            poller.wait(ceiling).context("poll")?;
            let now = self.clock.now();

            // Walk backwards so swap_remove only ever moves slots that have
            // already been looked at.
            for i in (0..poller.len()).rev() {
                let fd = poller.fd(i);
                let Some(slot) = slots.get_mut(&fd) else {
                    bail!("socket fd {} is not tracked by any connection", fd);
                };
                let mut entry = store.entry(slot.index);

                let finished = if poller.is_active(i) {
                    match proto.step(&mut entry, &mut slot.state, &slot.socket, &self.clock, now)? {
                        Step::Pending(interest) => {
                            poller.reregister(i, interest);
                            false
                        }
                        Step::Finished => true,
                    }
                } else {
                    let age = now.saturating_sub(slot.state.begin);
                    if age >= cfg.timeout_ns {
                        entry.finish(outcome::TIMED_OUT, age);
                        true
                    } else {
                        false
                    }
                };

                if finished {
                    poller.swap_remove(i);
                    // out of the map before the descriptor is released
                    if let Some(slot) = slots.remove(&fd) {
                        self.resolve(store, P::KIND, slot.index, &entry);
                    }
                }
            }
            self.metrics.set_in_flight(poller.len());
        }

        summary.wall_ns = self.clock.now() - run_start;
        progress_report(summary.wall_ns, total, store.processed(), 0);
        info!(
            protocol = %P::KIND,
            started = summary.started,
            skipped = summary.skipped,
            peak_in_flight = summary.peak_in_flight,
            elapsed = %format_elapsed(summary.wall_ns),
            "probe run complete"
        );
        Ok(summary)
    }

    fn start<S, P>(
        &self,
        store: &mut S,
        proto: &P,
        index: usize,
        now: u64,
        poller: &mut Poller,
        slots: &mut HashMap<RawFd, Slot<P::Phase>>,
    ) -> Result<()>
    where
        S: ConnStore + ?Sized,
        P: Protocol,
    {
        let socket = Socket::new(proto.domain(), Type::STREAM, Some(SockProtocol::TCP))
            .context("socket")?;
        socket.set_nonblocking(true).context("fcntl(O_NONBLOCK)")?;
        let fd = socket.as_raw_fd();
        if fd < 0 || fd as u64 >= self.fd_limit {
            bail!("socket fd {} out of expected range", fd);
        }
        if slots.contains_key(&fd) {
            bail!("socket fd {} handed out while still in flight", fd);
        }

        let mut entry = store.entry(index);
        let mut state = ConnState::<P::Phase>::default();
        self.metrics.observe_start(P::KIND);
        trace!(index, target = %entry.target(), fd, "starting connection");

        match proto.step(&mut entry, &mut state, &socket, &self.clock, now)? {
            Step::Pending(interest) => {
                poller.register(fd, interest);
                slots.insert(
                    fd,
                    Slot {
                        index,
                        socket,
                        state,
                    },
                );
            }
            Step::Finished => {
                drop(socket);
                self.resolve(store, P::KIND, index, &entry);
            }
        }
        Ok(())
    }

    fn resolve<S>(&self, store: &mut S, kind: ProbeKind, index: usize, entry: &ConnEntry)
    where
        S: ConnStore + ?Sized,
    {
        store.store_result(index, entry);
        store.set_processed(store.processed() + 1);
        self.metrics.observe_result(kind, entry);
        trace!(
            index,
            target = %entry.target(),
            result = outcome::label(entry.result),
            elapsed_ns = entry.elapsed_ns,
            "connection resolved"
        );
    }
}

/// Bring the processed count in line with the entries actually marked done,
/// e.g. after a run that died between the two writes.
fn reconcile_processed<S: ConnStore + ?Sized>(store: &mut S) {
    let completed = store.completed();
    if store.processed() != completed {
        warn!(
            recorded = store.processed(),
            completed, "processed count disagrees with entries; using entries"
        );
        store.set_processed(completed);
    }
}

fn spacing_elapsed(last_start: Option<u64>, now: u64, spacing_ns: u64) -> bool {
    last_start.is_none_or(|t| now.saturating_sub(t) >= spacing_ns)
}

/// How long the multiplexer may sleep: never past the earliest pending
/// deadline, never past the moment spacing allows the next start (when a
/// start is otherwise possible), and never longer than one timeout.
fn wait_ceiling(
    cfg: &RunConfig,
    now: u64,
    begins: impl Iterator<Item = u64>,
    next_start_after: Option<u64>,
) -> u64 {
    let mut ceiling = cfg.timeout_ns;
    for begin in begins {
        let deadline = begin.saturating_add(cfg.timeout_ns);
        ceiling = ceiling.min(deadline.saturating_sub(now));
    }
    if let Some(last) = next_start_after {
        ceiling = ceiling.min(last.saturating_add(cfg.spacing_ns).saturating_sub(now));
    }
    ceiling
}

fn progress_report(elapsed: u64, total: usize, processed: usize, pending: usize) {
    info!(
        target: PROGRESS_TARGET,
        "{}: {}/{} probes complete, {} in progress",
        format_elapsed(elapsed),
        processed,
        total,
        pending
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: RunConfig = RunConfig {
        spacing_ns: 100,
        timeout_ns: 1_000,
    };

    #[test]
    fn ceiling_defaults_to_timeout() {
        assert_eq!(wait_ceiling(&CFG, 50, std::iter::empty(), None), 1_000);
    }

    #[test]
    fn ceiling_tracks_earliest_deadline() {
        let begins = [400u64, 200, 900];
        assert_eq!(wait_ceiling(&CFG, 1_000, begins.into_iter(), None), 200);
        // already overdue
        assert_eq!(wait_ceiling(&CFG, 1_500, begins.into_iter(), None), 0);
    }

    #[test]
    fn ceiling_respects_spacing_when_a_start_is_possible() {
        assert_eq!(wait_ceiling(&CFG, 1_030, std::iter::empty(), Some(1_000)), 70);
        assert_eq!(wait_ceiling(&CFG, 1_300, std::iter::empty(), Some(1_000)), 0);
    }

    #[test]
    fn first_start_is_never_delayed() {
        assert!(spacing_elapsed(None, 0, u64::MAX));
        assert!(!spacing_elapsed(Some(10), 50, 100));
        assert!(spacing_elapsed(Some(10), 110, 100));
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        assert!(Scheduler::new(Some(0)).is_err());
        assert!(Scheduler::new(Some(usize::MAX)).is_err());
        assert_eq!(Scheduler::new(Some(4)).unwrap().max_concurrency(), 4);
    }
}
