use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dial_probe::buffer::{ConnList, RunConfig, SharedBuffer};
use dial_probe::config::{LogFormat, ProbeConfig};
use dial_probe::prober::socks5::Socks5;
use dial_probe::prober::tcp_connect::Direct;
use dial_probe::prober::Protocol;
use dial_probe::scheduler::Scheduler;
use dial_probe::{textio, timestamp, util};

/// Default SOCKS port when `--proxy` names only a host.
const SOCKS_DEFAULT_PORT: u16 = 1080;

/// dial-probe — measure TCP connection-establishment time to many targets.
#[derive(Debug, Parser)]
#[command(
    name = "dial-probe",
    version,
    about = "Measure TCP dial time to many IPv4 targets, directly or through a SOCKS5 proxy.",
    long_about = "Measure TCP dial time to many IPv4 targets, directly or through a SOCKS5 proxy.\n\n\
                  In 'direct' and 'socks5' mode the targets and results live in a shared \
                  connection buffer inherited on --buffer-fd (stdin by default)."
)]
struct Cli {
    /// Descriptor holding the shared connection buffer.
    #[arg(long, default_value_t = 0, global = true)]
    buffer_fd: RawFd,

    /// Max concurrent connection attempts (default: open file limit minus 3).
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Do not close descriptors inherited from the parent.
    #[arg(long, default_value_t = false, global = true)]
    keep_fds: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Connect to each target directly.
    Direct,
    /// Connect to each target through a SOCKS5 proxy (no authentication).
    Socks5 {
        /// Proxy host name or address.
        proxy_host: String,
        /// Proxy TCP port or service name.
        proxy_port: String,
    },
    /// Read `ipv4 port` lines from stdin and print `ipv4 port errno seconds`
    /// lines once every connection has resolved.
    Stream {
        /// Max concurrent connection attempts.
        #[arg(long)]
        parallel: usize,
        /// Minimum seconds between connection starts.
        #[arg(long, value_parser = timestamp::parse_decimal_seconds)]
        spacing: u64,
        /// Seconds before an unresolved attempt counts as timed out.
        #[arg(long, value_parser = timestamp::parse_decimal_seconds)]
        timeout: u64,
        /// Route through a SOCKS5 proxy, HOST[:PORT].
        #[arg(long)]
        proxy: Option<String>,
    },
}

fn main() -> ExitCode {
    let progname = std::env::args()
        .next()
        .and_then(|a| Path::new(&a).file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "dial-probe".to_string());

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", progname, e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Clean up in case the parent was sloppy; before anything of ours is open.
    let closed = if cli.keep_fds {
        0
    } else {
        util::close_inherited_fds(&[cli.buffer_fd])?
    };

    let mut config = ProbeConfig::load()?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.max_concurrency.is_some() {
        config.max_concurrency = cli.max_concurrency;
    }
    config.validate()?;
    init_tracing(&config)?;
    debug!(closed, "closed inherited descriptors");

    match cli.mode {
        Mode::Direct => run_shared(&config, cli.buffer_fd, &Direct),
        Mode::Socks5 {
            proxy_host,
            proxy_port,
        } => {
            let proxy = util::resolve_port(&proxy_port)
                .and_then(|port| util::resolve_host_port(&proxy_host, port))
                .with_context(|| {
                    format!("error parsing proxy address '{}:{}'", proxy_host, proxy_port)
                })?;
            info!(%proxy, "probing through SOCKS5 proxy");
            run_shared(&config, cli.buffer_fd, &Socks5::new(proxy))
        }
        Mode::Stream {
            parallel,
            spacing,
            timeout,
            proxy,
        } => {
            let run_cfg = RunConfig {
                spacing_ns: spacing,
                timeout_ns: timeout,
            };
            match proxy {
                None => run_stream(&config, parallel, run_cfg, &Direct),
                Some(spec) => {
                    let (host, port) = util::parse_host_port(&spec, SOCKS_DEFAULT_PORT);
                    let proxy = util::resolve_host_port(&host, port)
                        .with_context(|| format!("error parsing proxy address '{}'", spec))?;
                    info!(%proxy, "probing through SOCKS5 proxy");
                    run_stream(&config, parallel, run_cfg, &Socks5::new(proxy))
                }
            }
        }
    }
}

fn init_tracing(config: &ProbeConfig) -> Result<()> {
    let filter = config.log_filter(EnvFilter::from_default_env())?;
    // stdout belongs to the stream adapter's results
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn run_shared<P: Protocol>(config: &ProbeConfig, fd: RawFd, proto: &P) -> Result<()> {
    let mut buffer = SharedBuffer::from_fd(fd)?;
    let scheduler =
        Scheduler::new(config.max_concurrency)?.with_progress_interval(config.progress_interval());
    scheduler.run(&mut *buffer, proto)?;
    buffer.flush()?;
    write_metrics(config, &scheduler)
}

fn run_stream<P: Protocol>(
    config: &ProbeConfig,
    parallel: usize,
    run_cfg: RunConfig,
    proto: &P,
) -> Result<()> {
    let targets = textio::read_targets(io::stdin().lock())?;
    let mut list = ConnList::new(run_cfg, &targets);
    let scheduler =
        Scheduler::new(Some(parallel))?.with_progress_interval(config.progress_interval());
    scheduler.run(&mut list, proto)?;
    textio::write_results(io::stdout().lock(), list.entries())?;
    write_metrics(config, &scheduler)
}

fn write_metrics(config: &ProbeConfig, scheduler: &Scheduler) -> Result<()> {
    if let Some(path) = &config.metrics_textfile {
        scheduler.metrics().write_textfile(path)?;
        debug!(path = %path.display(), "wrote metrics");
    }
    Ok(())
}
