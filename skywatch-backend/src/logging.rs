use anyhow::Context;
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::task;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log files older than this are removed
const MAX_LOG_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 3);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Keeps the non-blocking file writer flushing until dropped
#[allow(dead_code)]
pub struct LoggerGuard(WorkerGuard);

fn level_directive(level: &str) -> (Directive, bool) {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => match level.parse::<Directive>() {
            Ok(directive) => (directive, true),
            Err(_) => (LevelFilter::INFO.into(), false),
        },
        _ => (LevelFilter::INFO.into(), false),
    }
}

/// Install a daily-rolling file layer and an ANSI stdout layer.
///
/// `RUST_LOG` overrides `level` for both. Must be called from within a
/// tokio runtime, since it spawns the old-log cleanup task.
pub fn init_logging(log_dir: impl AsRef<Path>, prefix: &str, level: &str) -> anyhow::Result<LoggerGuard> {
    let log_dir = log_dir.as_ref().to_path_buf();
    let (directive, valid_level) = level_directive(level);

    let builder = EnvFilter::builder().with_default_directive(directive);
    let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
    let console_filter = builder.clone().parse_lossy(&rust_log);
    let file_filter = builder.parse_lossy(&rust_log);

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(&log_dir)
        .with_context(|| format!("Failed to create log appender in {}", log_dir.display()))?;
    let (non_blocking, guard) = NonBlocking::new(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if !valid_level {
        tracing::warn!("Invalid log level '{}', defaulting to 'info'", level);
    }

    start_log_cleanup_task(log_dir, prefix.to_string());

    Ok(LoggerGuard(guard))
}

fn start_log_cleanup_task(log_dir: PathBuf, prefix: String) {
    task::spawn(async move {
        loop {
            match cleanup_old_logs(&log_dir, &prefix, MAX_LOG_AGE) {
                Ok(0) => {}
                Ok(deleted) => tracing::info!("Deleted {} old log files", deleted),
                Err(e) => tracing::warn!("Failed to delete old log files: {}", e),
            }
            tokio::time::sleep(CLEANUP_INTERVAL).await;
        }
    });
}

/// Remove `<prefix>*.log` files last modified more than `max_age` ago.
/// Returns how many were deleted.
fn cleanup_old_logs(log_dir: &Path, prefix: &str, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(file_name.starts_with(prefix) && file_name.ends_with(".log")) {
            continue;
        }

        let modified = fs::metadata(&path)?.modified();
        if let Ok(modified) = modified {
            if now.duration_since(modified).unwrap_or_default() > max_age {
                fs::remove_file(&path)?;
                tracing::debug!("Old log file deleted: {}", file_name);
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert!(level_directive("debug").1);
        assert!(level_directive("error").1);

        let (directive, valid) = level_directive("loud");
        assert!(!valid);
        assert_eq!(directive.to_string(), "info");
    }

    #[test]
    fn test_cleanup_only_touches_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let old_log = dir.path().join("skywatch-backend.2026-10-01.log");
        let other_log = dir.path().join("another-service.2026-10-01.log");
        let journal = dir.path().join("skywatch-backend.jsonl");
        for path in [&old_log, &other_log, &journal] {
            fs::write(path, "line\n").unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));

        let deleted = cleanup_old_logs(dir.path(), "skywatch-backend", Duration::ZERO).unwrap();
        assert_eq!(deleted, 1);
        assert!(!old_log.exists());
        assert!(other_log.exists());
        assert!(journal.exists());

        // Fresh files are kept under the real retention period
        fs::write(&old_log, "line\n").unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), "skywatch-backend", MAX_LOG_AGE).unwrap(), 0);
        assert!(old_log.exists());
    }
}
