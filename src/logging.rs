use std::path::PathBuf;

use anyhow::Context;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};

use crate::config;

pub fn init_logging() -> anyhow::Result<()> {
    let spec = std::env::var(config::logging::LOG_SPEC_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| config::logging::DEFAULT_LOG_SPEC.to_string());

    // File logs get everything allowed by the spec; stderr only sees warnings and up so the
    // human-readable progress on stdout stays clean.
    let logger = Logger::try_with_str(&spec).with_context(|| format!("invalid log spec '{spec}'"))?;
    let handle = match log_dir() {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename(config::logging::LOG_FILE_NAME))
            .rotate(
                Criterion::Size(config::logging::LOG_ROTATE_SIZE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(config::logging::LOG_ROTATE_KEEP_FILES),
            )
            .duplicate_to_stderr(Duplicate::Warn)
            .format(flexi_logger::detailed_format)
            .start(),
        None => logger.log_to_stderr().format(flexi_logger::default_format).start(),
    };
    // The handle must outlive main for the file writer; leaking it is fine for a one-shot tool.
    std::mem::forget(handle.context("failed to start logger")?);

    log::info!("{}", "=".repeat(60));
    log::info!("{} starting", config::TOOL_NAME);
    log::info!("Version: {}", config::TOOL_VERSION);
    log::info!("Platform: {}", std::env::consts::OS);
    log::info!("{}", "=".repeat(60));

    Ok(())
}

/// Log directory under the home dir, or None when it cannot be created (stderr-only logging).
fn log_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(config::logging::LOG_DIR_REL);
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

pub fn home_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("HOME") {
        if !v.is_empty() {
            return Some(PathBuf::from(v));
        }
    }
    // Windows fallback
    if let Ok(v) = std::env::var("USERPROFILE") {
        if !v.is_empty() {
            return Some(PathBuf::from(v));
        }
    }
    None
}
