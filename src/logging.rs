//! Process-wide logging context.
//!
//! One subscriber with two outputs: stdout and a size-capped log file that
//! rolls over into numbered backups (`running_logs.log.1` .. `.5`).
//! [`init_logging`] is called once from `main`; the returned
//! [`LoggingGuard`] flushes the file when it goes out of scope.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file_name: String,
    /// Rotate once the current file would grow past this many bytes.
    pub max_bytes: u64,
    /// Number of rotated files to keep.
    pub backups: usize,
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "running_logs.log".to_string(),
            max_bytes: 1_000_000,
            backups: 5,
            level: "info".to_string(),
        }
    }
}

struct WriterState {
    file: File,
    written: u64,
}

/// Append-only file writer that rotates by size.
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    state: Mutex<WriterState>,
}

impl RotatingFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            backups,
            state: Mutex::new(WriterState { file, written }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&self, state: &mut WriterState) -> io::Result<()> {
        state.file.flush()?;

        if self.backups > 0 {
            for i in (1..self.backups).rev() {
                let src = self.backup_path(i);
                if src.exists() {
                    fs::rename(&src, self.backup_path(i + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            state.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        } else {
            state.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        }

        state.written = 0;
        Ok(())
    }
}

impl Write for &RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;

        if self.max_bytes > 0
            && state.written > 0
            && state.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate(&mut state)?;
        }

        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        state.file.flush()
    }
}

/// Keeps the file writer alive and flushes it on drop.
pub struct LoggingGuard {
    writer: Arc<RotatingFileWriter>,
}

impl LoggingGuard {
    pub fn log_file(&self) -> &Path {
        self.writer.path()
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        let _ = (&*self.writer).flush();
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let log_path = config.dir.join(&config.file_name);
    let writer = Arc::new(
        RotatingFileWriter::new(&log_path, config.max_bytes, config.backups)
            .with_context(|| format!("cannot open log file {}", log_path.display()))?,
    );

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(io::stdout))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer.clone()),
        )
        .try_init()
        .context("failed to initialize logging")?;

    tracing::info!("Logging setup is complete.");
    Ok(LoggingGuard { writer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotates_when_cap_is_exceeded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let writer = RotatingFileWriter::new(&path, 10, 2).unwrap();

        (&writer).write_all(b"0123456789").unwrap();
        (&writer).write_all(b"abc").unwrap();
        (&writer).flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "abc");
        assert_eq!(fs::read_to_string(dir.path().join("app.log.1")).unwrap(), "0123456789");
    }

    #[test]
    fn keeps_at_most_configured_backups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let writer = RotatingFileWriter::new(&path, 4, 2).unwrap();

        for chunk in ["aaaa", "bbbb", "cccc", "dddd"] {
            (&writer).write_all(chunk.as_bytes()).unwrap();
        }
        (&writer).flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "dddd");
        assert_eq!(fs::read_to_string(dir.path().join("app.log.1")).unwrap(), "cccc");
        assert_eq!(fs::read_to_string(dir.path().join("app.log.2")).unwrap(), "bbbb");
        assert!(!dir.path().join("app.log.3").exists());
    }

    #[test]
    fn appends_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "old ").unwrap();

        let writer = RotatingFileWriter::new(&path, 1_000, 5).unwrap();
        (&writer).write_all(b"new").unwrap();
        (&writer).flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "old new");
    }
}
