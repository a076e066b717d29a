use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_FILE_PREFIX: &str = "server_dispatch.log";
const KEEP_LOG_FILES: usize = 7;

/// Installs the global subscriber: stdout plus a daily-rolling file.
///
/// `RUST_LOG` wins over `log_level`. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir, KEEP_LOG_FILES)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()?;

    Ok(guard)
}

/// Deletes rotated log files beyond the newest `keep`.
///
/// Rotated names end in the date, so name order is age order.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<()> {
    let mut logs: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .map(|e| e.path())
        .collect();

    // newest first
    logs.sort_by(|a, b| b.cmp(a));

    for path in logs.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_logs() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2026-10-01", "2026-10-02", "2026-10-03"] {
            fs::write(dir.path().join(format!("{LOG_FILE_PREFIX}.{day}")), "x").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        cleanup_old_logs(dir.path(), 2).unwrap();

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                format!("{LOG_FILE_PREFIX}.2026-10-02"),
                format!("{LOG_FILE_PREFIX}.2026-10-03"),
                "unrelated.txt".to_string(),
            ]
        );
    }
}
