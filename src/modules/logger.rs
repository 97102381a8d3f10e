use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use crate::modules::paths::get_data_dir;

const LOG_PREFIX: &str = "http-relay";

// Timestamps in the local timezone
struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

pub fn get_log_dir() -> Result<PathBuf, String> {
    let data_dir = get_data_dir()?;
    let log_dir = data_dir.join("logs");

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir).map_err(|e| format!("Failed to create log directory: {}", e))?;
    }

    Ok(log_dir)
}

/// File name for a node's log; several nodes may share one data directory.
pub fn log_file_name(node_id: &str) -> String {
    let safe: String = node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        format!("{}.log", LOG_PREFIX)
    } else {
        format!("{}-{}.log", LOG_PREFIX, safe)
    }
}

/// Initialize logging for `node_id`: console always, a daily-rolled file
/// when the log directory is writable. `RUST_LOG` controls the filter.
pub fn init_logger(node_id: &str) {
    // route `log` records from dependencies into tracing
    let _ = tracing_log::LogTracer::init();

    let log_dir = match get_log_dir() {
        Ok(dir) => Some(dir),
        Err(e) => {
            eprintln!("Cannot initialize log directory: {}", e);
            None
        }
    };

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;
    let mut file_layer = None;

    if let Some(dir) = log_dir {
        if is_log_dir_writable(&dir) {
            let file_appender = tracing_appender::rolling::daily(dir, log_file_name(node_id));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            file_guard = Some(guard);
            file_layer = Some(
                fmt::Layer::new()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(LocalTimer),
            );
        } else {
            eprintln!("Log directory is not writable, logging to console only");
        }
    }

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(LocalTimer);

    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Some(guard) = file_guard {
        // the writer lives for the whole process
        std::mem::forget(guard);
        info!(node_id, file = %log_file_name(node_id), "Logging initialized (console + file)");
    } else {
        info!(node_id, "Logging initialized (console)");
    }
}

fn is_log_dir_writable(dir: &Path) -> bool {
    let probe = dir.join(".write_test");
    let result = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
        .and_then(|mut f| f.write_all(b"ok"));

    if result.is_ok() {
        let _ = fs::remove_file(probe);
        true
    } else {
        false
    }
}
