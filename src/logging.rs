//! Logging bootstrap.
//!
//! stdout carries the protocol, so logs go to stderr unless a log directory
//! is configured, in which case they rotate on disk.

use crate::config::Config;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};

const LOG_FILE_BASENAME: &str = "studyd";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

/// Starts the logger. The returned handle must stay alive for the whole
/// process or buffered file output is lost.
pub fn init(cfg: &Config) -> anyhow::Result<LoggerHandle> {
    let logger = Logger::try_with_str(&cfg.log_level)
        .map_err(|e| anyhow::anyhow!("invalid log level `{}`: {e}", cfg.log_level))?;

    let handle = match cfg.log_dir.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir.as_path())
                        .basename(LOG_FILE_BASENAME),
                )
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
                .start()?
        }
        None => logger
            .log_to_stderr()
            .format_for_stderr(flexi_logger::default_format)
            .start()?,
    };

    log::info!(
        "event=start version={} log_dir={}",
        env!("CARGO_PKG_VERSION"),
        cfg.log_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "stderr".to_string())
    );
    Ok(handle)
}
