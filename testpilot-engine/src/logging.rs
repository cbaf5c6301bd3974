//! Logging bootstrap
//!
//! Console layer plus an optional non-blocking file layer writing
//! `<log-dir>/testpilot_<ts>.log`. Level resolution: explicit argument, then
//! TESTPILOT_LOG_LEVEL, then "info".

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use testpilot_common::{Error, Result};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// One of DEBUG, INFO, WARNING, ERROR, CRITICAL (case-insensitive)
    pub level: Option<String>,
    pub log_dir: PathBuf,
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            log_dir: PathBuf::from("logs"),
            file_logging: true,
        }
    }
}

/// Map the CLI level vocabulary onto tracing filter directives
fn filter_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        _ => "info",
    }
}

impl LoggingConfig {
    pub fn resolve_level(&self) -> String {
        self.level
            .clone()
            .or_else(|| std::env::var("TESTPILOT_LOG_LEVEL").ok())
            .unwrap_or_else(|| "INFO".to_string())
    }

    pub fn resolve_dir(&self) -> PathBuf {
        std::env::var("TESTPILOT_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.log_dir.clone())
    }

    /// Install the global subscriber. The returned guard must stay alive for
    /// the duration of the run or buffered file output is lost.
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let directive = filter_directive(&self.resolve_level());
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directive));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .with_writer(std::io::stderr);

        if self.file_logging {
            let dir = self.resolve_dir();
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::config(format!("Cannot create log dir {}: {e}", dir.display()))
            })?;
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let file = std::fs::File::create(dir.join(format!("testpilot_{timestamp}.log")))
                .map_err(|e| Error::config(format!("Cannot create log file: {e}")))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer.boxed())
                .with(file_layer.boxed())
                .init();
            Ok(Some(guard))
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer.boxed())
                .init();
            Ok(None)
        }
    }
}

/// Timestamped path for the structured failure log
pub fn failure_log_path(dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("testpilot_failures_{timestamp}.log"))
}
