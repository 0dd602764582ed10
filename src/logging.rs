//! Tracing subscriber setup for the binary.
//!
//! The per-invocation log file lives inside the subject's derivatives tree,
//! which must stay untouched when an invocation is rejected. Its events are
//! therefore held in memory until [`open_log_file`] is called once the
//! invocation has been planned.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static LOG_FILE: OnceLock<DeferredLogFile> = OnceLock::new();

/// Installs the global subscriber.
///
/// Filter priority: `RUST_LOG` > `default_filter` (the `--log-level` flag).
/// With `log_file`, a second non-ANSI layer mirrors every event into that
/// file; the returned guard flushes it and must outlive the pipeline.
pub fn init(default_filter: &str, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_writer = log_file.map(|path| {
        let file = LOG_FILE.get_or_init(|| DeferredLogFile::new(path));
        tracing_appender::non_blocking(file.clone())
    });

    match file_writer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
            None
        }
    }
}

/// Creates the log file given to [`init`] and flushes the events held so far.
///
/// Does nothing when no log file was configured.
pub fn open_log_file() {
    let Some(file) = LOG_FILE.get() else {
        return;
    };
    if let Err(e) = file.open() {
        warn!(path = %file.path().display(), error = %e, "Cannot create log file");
    }
}

/// A log file created on [`open`](Self::open).
///
/// Writes before that are buffered and dropped with the value if the file
/// is never opened.
#[derive(Debug, Clone)]
pub struct DeferredLogFile {
    path: PathBuf,
    state: Arc<Mutex<LogFileState>>,
}

#[derive(Debug)]
enum LogFileState {
    Pending(Vec<u8>),
    Open(File),
}

impl DeferredLogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(LogFileState::Pending(Vec::new()))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.lock().as_deref(), Ok(LogFileState::Open(_)))
    }

    /// Creates the file and its parent directories, then writes the buffer.
    pub fn open(&self) -> io::Result<()> {
        let mut state = self.lock()?;
        if let LogFileState::Pending(buffer) = &*state {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(buffer)?;
            *state = LogFileState::Open(file);
        }
        Ok(())
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, LogFileState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))
    }
}

impl Write for DeferredLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.lock()? {
            LogFileState::Pending(buffer) => {
                buffer.extend_from_slice(buf);
                Ok(buf.len())
            }
            LogFileState::Open(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.lock()? {
            LogFileState::Pending(_) => Ok(()),
            LogFileState::Open(file) => file.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_nothing_created_before_open() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("derivatives/S/logs");
        let mut file = DeferredLogFile::new(logs.join("run.log"));

        writeln!(file, "planning").unwrap();
        file.flush().unwrap();
        drop(file);

        assert!(!dir.path().join("derivatives").exists());
    }

    #[test]
    fn test_open_writes_buffered_events_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("derivatives/S/logs/run.log");
        let mut file = DeferredLogFile::new(&path);

        writeln!(file, "planning").unwrap();
        assert!(!file.is_open());
        file.open().unwrap();
        writeln!(file, "sorting").unwrap();
        file.open().unwrap();
        file.flush().unwrap();

        assert!(file.is_open());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "planning\nsorting\n");
    }

    #[test]
    fn test_clones_share_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/run.log");
        let file = DeferredLogFile::new(&path);
        let mut writer = file.clone();

        writeln!(writer, "event").unwrap();
        file.open().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "event\n");
    }
}
