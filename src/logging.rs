//! Logging Module
//!
//! Installs the process-wide tracing subscriber: an env-filtered compact
//! console layer and, when a log directory is configured, a daily rolling
//! file layer. Also prunes old rolled files.

use crate::config::LoggingConfig;
use crate::{Result, TunnelError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix of rolled application logs
pub const LOG_FILE_PREFIX: &str = "proxy-tunnel.log";

/// Days of rolled logs kept by [`LoggerManager::rotate_logs`]
pub const DEFAULT_KEEP_DAYS: u32 = 30;

pub struct LoggerManager {
    pub config: LoggingConfig,
    started_at: Option<DateTime<Utc>>,
}

impl LoggerManager {
    /// Create a new logger manager
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            started_at: None,
        }
    }

    /// When [`LoggerManager::initialize`] ran
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Initialize the logging system
    pub fn initialize(&mut self) -> Result<()> {
        if let Some(dir) = &self.config.log_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                TunnelError::IoError(format!("Failed to create log directory {:?}: {}", dir, e))
            })?;
        }

        let file_layer = self.config.log_dir.as_ref().map(|dir| {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .compact()
        });

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // Use config log_level, but allow RUST_LOG env var to override
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        self.started_at = Some(Utc::now());
        match result {
            Ok(_) => {
                info!("Logging initialized at level {}", self.config.log_level);
                if let Some(dir) = &self.config.log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }
        Ok(())
    }

    /// Remove rolled log files older than `keep_days`. Returns how many
    /// files were removed.
    pub fn rotate_logs(&self, keep_days: u32) -> Result<usize> {
        match &self.config.log_dir {
            Some(dir) => cleanup_old_logs(dir, keep_days),
            None => Ok(0),
        }
    }

    /// Path of today's log file, if file logging is configured
    pub fn current_log_file(&self) -> Option<PathBuf> {
        let dir = self.config.log_dir.as_ref()?;
        let date = Utc::now().format("%Y-%m-%d");
        Some(dir.join(format!("{}.{}", LOG_FILE_PREFIX, date)))
    }
}

fn cleanup_old_logs(log_dir: &Path, keep_days: u32) -> Result<usize> {
    let cutoff_time = SystemTime::now() - Duration::from_secs(keep_days as u64 * 24 * 3600);
    let mut removed = 0;

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        let is_log = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff_time {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
            } else {
                debug!("Removed old log file: {:?}", entry.path());
                removed += 1;
            }
        }
    }
    Ok(removed)
}
