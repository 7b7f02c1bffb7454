//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. Stdout is never used: a process that hosts
//! a tool server speaks the protocol there. File output rotates on each start.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "toolhost=info,warn";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "toolhost.log";

/// Where log records are written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stderr,
    /// A rotating file in `dir`, or the platform data directory when `None`.
    File { dir: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub target: LogTarget,
    /// Emit JSON records instead of human-readable lines.
    pub json: bool,
    pub default_filter: String,
    /// Rotated files kept next to the live one.
    pub keep_files: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            target: LogTarget::Stderr,
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
            keep_files: 3,
        }
    }
}

/// Platform data directory for toolhost logs.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolhost");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhost")
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(options: LogOptions) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (writer, log_path) = match &options.target {
        LogTarget::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        LogTarget::File { dir } => {
            let dir = dir.clone().unwrap_or_else(data_dir);
            match open_log_file(&dir, options.keep_files) {
                Ok((file, path)) => (BoxMakeWriter::new(FlushingWriter::new(file)), Some(path)),
                Err(e) => {
                    eprintln!("toolhost: cannot open log file in {}: {e}; logging to stderr", dir.display());
                    (BoxMakeWriter::new(std::io::stderr), None)
                }
            }
        }
    };
    let ansi = log_path.is_none() && !options.json;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = ?log_path,
            pid = std::process::id(),
            "tracing initialized"
        );
    }
    installed
}

fn open_log_file(dir: &Path, keep: u32) -> std::io::Result<(File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&path, keep);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((file, path))
}

/// Rotate log files: `toolhost.log` → `.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write, so records survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("toolhost.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("toolhost.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("toolhost.log.1"), "current");
        assert_eq!(read("toolhost.log.2"), "one");
        assert!(!dir.path().join("toolhost.log.3").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = open_log_file(dir.path(), 3).unwrap();
        let mut writer = FlushingWriter::new(file).make_writer();
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "line one\n");
    }

    #[test]
    fn test_default_options() {
        let options = LogOptions::default();
        assert_eq!(options.target, LogTarget::Stderr);
        assert_eq!(options.default_filter, DEFAULT_FILTER);
        assert!(!options.json);
    }
}
