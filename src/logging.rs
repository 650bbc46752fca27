use anyhow::{Result, anyhow};
use std::path::Path;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT_GUARD: OnceLock<()> = OnceLock::new();

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn env_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber: stderr always, plus `log_file` when given.
///
/// The file layer uses a synchronous appender (no worker thread), so the
/// subscriber stays usable in the forked producer. Calling this twice is a no-op.
pub fn init(log_file: Option<&Path>, verbose: u8) -> Result<()> {
    if INIT_GUARD.set(()).is_err() {
        return Ok(());
    }

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(verbose));

    match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name: {path:?}"))?;
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::env::current_dir()?,
            };
            let appender = tracing_appender::rolling::never(dir, file_name);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter(verbose));

            if let Err(e) = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
            {
                tracing::debug!("global subscriber already set: {e}");
            }
        }
        None => {
            if let Err(e) = tracing_subscriber::registry().with(stderr_layer).try_init() {
                tracing::debug!("global subscriber already set: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_directive() {
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(1), "debug");
        assert_eq!(default_directive(7), "trace");
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init(None, 0).unwrap();
        init(None, 2).unwrap();
        tracing::debug!("still logging after a second init");
    }
}
