//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

const LOG_ENV_VAR: &str = "IPROV_LOG";
const LOG_FILE_NAME: &str = "iprov.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Verbosity selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Warn,
    #[default]
    Info,
    Debug,
}

impl Verbosity {
    /// Default filter directive used when `IPROV_LOG` is unset
    pub fn directive(self) -> &'static str {
        match self {
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "iprov=debug,iprov_core=debug,iprov_daemon=debug,iprov_app=debug,ios_provider=debug,info",
        }
    }
}

/// Initialize the logging subsystem
///
/// Logs go to stderr and to a daily file under
/// `~/.local/share/ios-provider/logs/`. The level comes from the
/// `IPROV_LOG` environment variable, falling back to `verbosity`.
///
/// # Examples
/// ```bash
/// IPROV_LOG=debug iprov
/// IPROV_LOG=iprov_daemon::stream=trace iprov
/// ```
pub fn init(verbosity: Verbosity) -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("iOS provider starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Filter from `IPROV_LOG`, or `verbosity` when unset or unparseable
fn env_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(verbosity.directive()))
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("ios-provider").join("logs")
}

/// Get the log file path for the current day
pub fn get_current_log_file() -> PathBuf {
    get_log_directory().join(LOG_FILE_NAME)
}

/// Shorten a device identifier for log output: `***` plus the last 4 characters
pub fn censor_udid(udid: &str) -> String {
    let tail: String = udid
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_prefers_environment() {
        std::env::set_var(LOG_ENV_VAR, "iprov_daemon=trace");
        assert_eq!(env_filter(Verbosity::Warn).to_string(), "iprov_daemon=trace");
        std::env::remove_var(LOG_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_verbosity() {
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(env_filter(Verbosity::Warn).to_string(), "warn");
    }

    #[test]
    fn test_censor_udid_keeps_last_four() {
        assert_eq!(censor_udid("00008030-001A2C3E0E42802E"), "***802E");
    }

    #[test]
    fn test_censor_udid_short_input() {
        assert_eq!(censor_udid("AB"), "***AB");
        assert_eq!(censor_udid(""), "***");
    }

    #[test]
    fn test_log_file_lives_in_log_directory() {
        let file = get_current_log_file();
        assert!(file.ends_with("ios-provider/logs/iprov.log"));
    }

    #[test]
    fn test_verbosity_directives() {
        assert_eq!(Verbosity::Warn.directive(), "warn");
        assert_eq!(Verbosity::default(), Verbosity::Info);
        assert!(Verbosity::Debug.directive().contains("iprov_daemon=debug"));
    }
}
