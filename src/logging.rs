//! Tracing setup for the phasegate binary.
//!
//! Human-readable compact output goes to stderr. When a log directory is
//! given, a JSON copy of every event is also written there through a
//! non-blocking daily-rolling appender.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable that overrides the computed filter.
pub const LOG_ENV: &str = "PHASEGATE_LOG";

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("phasegate=debug,info")
            } else {
                EnvFilter::try_new("phasegate=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns the appender guard when file logging is enabled; dropping it
/// flushes and stops the background writer, so the caller keeps it alive for
/// the life of the process.
pub fn init_tracing(
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .compact();

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "phasegate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let json_layer = fmt::layer().json().with_writer(writer).with_target(true);
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .with(json_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .try_init()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_builds_for_both_modes() {
        let quiet = env_filter(false).to_string();
        let loud = env_filter(true).to_string();
        assert!(!quiet.is_empty());
        assert!(!loud.is_empty());
    }
}
