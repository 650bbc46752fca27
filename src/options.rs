use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use nix::sys::signal::Signal;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_PACE_MS: u64 = 250;
const MAX_PACE_MS: u64 = 5000;

#[derive(Clone, Debug, Parser)]
#[command(
    version,
    about = "Spawn a multi-threaded counter process and inspect it from outside with ptrace"
)]
pub struct Options {
    /// Number of worker threads in the producer process.
    #[arg(short = 'w', long = "workers", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Delay (ms) between a directed signal and the next inspection, and between
    /// the two snapshots of one inspection.
    #[arg(long = "pace-ms", default_value_t = DEFAULT_PACE_MS)]
    pub pace_ms: u64,

    /// Signal the producer sends once its workers are running.
    #[arg(long = "ready-signal", default_value = "SIGUSR1", value_parser = parse_signal)]
    pub ready_signal: Signal,

    /// Signal the observer sends to tear the producer down.
    #[arg(long = "stop-signal", default_value = "SIGUSR1", value_parser = parse_signal)]
    pub stop_signal: Signal,

    /// Index (into the enumerated task list) of the task the experiment attaches to.
    #[arg(long = "representative")]
    pub representative: Option<usize>,

    /// How long to wait for the producer's startup signal.
    #[arg(long = "startup-timeout-ms", default_value_t = 10_000)]
    pub startup_timeout_ms: u64,

    /// Mirror diagnostics into this file.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` wins when set.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_signal(s: &str) -> std::result::Result<Signal, String> {
    let name = s.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal: {s:?}"))
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        if self.pace_ms == 0 || self.pace_ms > MAX_PACE_MS {
            return Err(anyhow!(
                "--pace-ms must be within 1..={MAX_PACE_MS}, got {}",
                self.pace_ms
            ));
        }
        for (flag, signal) in [
            ("--ready-signal", self.ready_signal),
            ("--stop-signal", self.stop_signal),
        ] {
            if matches!(
                signal,
                Signal::SIGSTOP | Signal::SIGCONT | Signal::SIGKILL
            ) {
                return Err(anyhow!("{flag} cannot be {signal}, it drives the experiment"));
            }
        }
        if self.startup_timeout_ms == 0 {
            return Err(anyhow!("--startup-timeout-ms must be positive"));
        }
        Ok(())
    }

    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            workers: self.workers,
            pace: Duration::from_millis(self.pace_ms),
            ready_signal: self.ready_signal,
            stop_signal: self.stop_signal,
            representative: self.representative,
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
        }
    }
}

/// Everything the observer and producer need to run one harness pass.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub workers: usize,
    pub pace: Duration,
    pub ready_signal: Signal,
    pub stop_signal: Signal,
    pub representative: Option<usize>,
    pub startup_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            pace: Duration::from_millis(DEFAULT_PACE_MS),
            ready_signal: Signal::SIGUSR1,
            stop_signal: Signal::SIGUSR1,
            representative: None,
            startup_timeout: Duration::from_secs(10),
        }
    }
}
