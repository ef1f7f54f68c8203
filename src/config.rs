use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::scheduler::{DEFAULT_PROGRESS_INTERVAL, PROGRESS_TARGET};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "PROBE_CONFIG";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Process-level settings. Per-run parameters (spacing, timeout, targets)
/// come from the connection buffer or the stream adapter, not from here.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Upper bound on in-flight connections; unset means "whatever the
    /// open file limit allows".
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Where to leave a Prometheus text rendering of the run's counters.
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_interval_secs() -> u64 {
    DEFAULT_PROGRESS_INTERVAL.as_secs()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            max_concurrency: None,
            progress_interval_secs: default_progress_interval_secs(),
            metrics_textfile: None,
        }
    }
}

impl ProbeConfig {
    /// Read the file named by `PROBE_CONFIG`, or fall back to defaults when
    /// the variable is unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: ProbeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the log level as a tracing::Level
    pub fn get_tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(tracing::Level::TRACE),
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" | "warning" => Ok(tracing::Level::WARN),
            "error" => Ok(tracing::Level::ERROR),
            _ => Err(anyhow::anyhow!("Invalid log level: {}. Valid levels are: trace, debug, info, warn, error", self.log_level))
        }
    }

    /// `base` (usually `RUST_LOG`) plus the configured level for this crate.
    /// Progress lines stay on at `info` so a quiet log level still shows
    /// the run advancing.
    pub fn log_filter(&self, base: EnvFilter) -> Result<EnvFilter> {
        let log_level = self.get_tracing_level()?;
        Ok(base
            .add_directive(format!("dial_probe={}", log_level.as_str().to_lowercase()).parse()?)
            .add_directive(format!("{}=info", PROGRESS_TARGET).parse()?))
    }

    pub fn validate(&self) -> Result<()> {
        self.get_tracing_level()?;
        if self.max_concurrency == Some(0) {
            return Err(anyhow::anyhow!("max_concurrency must be at least 1"));
        }
        if self.progress_interval_secs == 0 {
            return Err(anyhow::anyhow!("progress_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured_with(cfg: &ProbeConfig) -> String {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(cfg.log_filter(EnvFilter::default()).unwrap())
            .with_writer(move || Capture(sink.clone()))
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: PROGRESS_TARGET, "3/10 probes complete");
            tracing::info!("run summary");
            tracing::warn!("count reconciled");
        });
        let out = buf.lock().unwrap().clone();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn progress_survives_a_quiet_log_level() {
        let cfg = ProbeConfig {
            log_level: "warn".to_string(),
            ..ProbeConfig::default()
        };
        let out = captured_with(&cfg);
        assert!(out.contains("3/10 probes complete"), "{}", out);
        assert!(out.contains("count reconciled"), "{}", out);
        assert!(!out.contains("run summary"), "{}", out);
    }

    #[test]
    fn info_level_shows_everything_at_info() {
        let out = captured_with(&ProbeConfig::default());
        assert!(out.contains("3/10 probes complete"));
        assert!(out.contains("run summary"));
    }

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = ProbeConfig::from_json("{}").unwrap();
        assert_eq!(cfg, ProbeConfig::default());
        assert_eq!(cfg.progress_interval(), Duration::from_secs(60));
        assert_eq!(cfg.get_tracing_level().unwrap(), tracing::Level::INFO);
    }

    #[test]
    fn full_config_parses() {
        let cfg = ProbeConfig::from_json(
            r#"{
                "log_level": "WARNING",
                "log_format": "json",
                "max_concurrency": 200,
                "progress_interval_secs": 5,
                "metrics_textfile": "/var/lib/node_exporter/dial_probe.prom"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.get_tracing_level().unwrap(), tracing::Level::WARN);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.max_concurrency, Some(200));
        assert_eq!(
            cfg.metrics_textfile.as_deref(),
            Some(Path::new("/var/lib/node_exporter/dial_probe.prom"))
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ProbeConfig::from_json(r#"{"log_level": "loud"}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"max_concurrency": 0}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"progress_interval_secs": 0}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"spacing": 1}"#).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ProbeConfig::load_file(Path::new("/nonexistent/dial-probe.json")).is_err());
    }
}
