//! Logging setup for the Vigil agent.
//!
//! Every record goes to stderr and to a size-capped file under the agent's
//! log directory. Edge devices have small disks, so old files are dropped
//! once `MAX_LOG_FILES` exist.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "vigil_agent=info,vigil_db=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a Vigil binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub log_dir: &'a Path,
    /// Mirror the file filter on stderr instead of only warnings.
    pub verbose: bool,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter for both sinks.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log = RotatingLog::open(config.log_dir, config.app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
        .with_context(|| format!("Failed to open log file in {}", config.log_dir.display()))?;

    let stderr_filter = if config.verbose {
        filter()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(LogSink::new(log))
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

/// `<name>.log` plus numbered backups `<name>.log.1` (newest) .. `<name>.log.N`.
struct RotatingLog {
    dir: PathBuf,
    name: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let name: String = app_name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        let mut log = Self {
            dir: dir.to_path_buf(),
            name,
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        log.open_live()?;
        if log.written > log.limit {
            log.roll()?;
        }
        Ok(log)
    }

    fn live(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    fn backup(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.name, n))
    }

    fn open_live(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(self.live())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        let backups = self.keep - 1;
        if backups == 0 {
            File::create(self.live())?;
            return self.open_live();
        }

        match fs::remove_file(self.backup(backups)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        for n in (1..backups).rev() {
            rename_if_present(&self.backup(n), &self.backup(n + 1))?;
        }
        rename_if_present(&self.live(), &self.backup(1))?;
        self.open_live()
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written.saturating_add(buf.len() as u64) > self.limit {
            self.roll()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "log file closed"));
        };
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Shared handle handed to the fmt layer; each event writes under the lock.
#[derive(Clone)]
struct LogSink(Arc<Mutex<RotatingLog>>);

impl LogSink {
    fn new(log: RotatingLog) -> Self {
        Self(Arc::new(Mutex::new(log)))
    }

    fn lock(&self) -> MutexGuard<'_, RotatingLog> {
        // A panic mid-write leaves at worst a torn line.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roll_keeps_bounded_file_count() {
        let tmp = TempDir::new().unwrap();
        let mut log = RotatingLog::open(tmp.path(), "vigil agent", 3, 16).unwrap();

        for _ in 0..10 {
            log.write_all(b"0123456789abcdef").unwrap();
        }
        log.flush().unwrap();

        assert!(tmp.path().join("vigil_agent.log").exists());
        assert!(tmp.path().join("vigil_agent.log.1").exists());
        assert!(tmp.path().join("vigil_agent.log.2").exists());
        assert!(!tmp.path().join("vigil_agent.log.3").exists());
    }

    #[test]
    fn test_single_file_truncates_in_place() {
        let tmp = TempDir::new().unwrap();
        let mut log = RotatingLog::open(tmp.path(), "agent", 1, 8).unwrap();
        log.write_all(b"12345678").unwrap();
        log.write_all(b"abc").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(tmp.path().join("agent.log")).unwrap(), "abc");
        assert!(!tmp.path().join("agent.log.1").exists());
    }

    #[test]
    fn test_reopen_appends_to_existing_file() {
        let tmp = TempDir::new().unwrap();
        {
            let mut log = RotatingLog::open(tmp.path(), "agent", 2, 1024).unwrap();
            log.write_all(b"first\n").unwrap();
        }
        let mut sink = LogSink::new(RotatingLog::open(tmp.path(), "agent", 2, 1024).unwrap());
        sink.write_all(b"second\n").unwrap();
        sink.flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("agent.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
