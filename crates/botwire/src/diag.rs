//! Optional per-connection session diagnostics.
//!
//! With the `diagnostics` feature enabled, a `SessionLog` mirrors every
//! operation a connection performs into a timestamped log file, one line per
//! event. The feature is off by default and compiles to nothing: call sites
//! go through `diag!`, which drops its body when the feature is disabled.

#[cfg(feature = "diagnostics")]
mod session {
    use std::fs::{self, File, OpenOptions};
    use std::io::{LineWriter, Write};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use chrono::Local;
    use tracing::warn;

    /// Most collision-numbered filenames tried before giving up.
    const MAX_NAME_ATTEMPTS: u32 = 100;

    /// A line-oriented session log with millisecond timestamps.
    #[derive(Debug)]
    pub struct SessionLog {
        writer: Mutex<LineWriter<File>>,
        path: PathBuf,
    }

    impl SessionLog {
        /// Opens a new session log under the `logs/` directory.
        pub fn open(label: &str) -> std::io::Result<Self> {
            Self::open_in("logs", label)
        }

        /// Opens a new session log under `dir`, creating the directory as
        /// needed. The filename carries the label and the open timestamp; a
        /// numeric suffix resolves collisions between sessions opened in
        /// the same second.
        pub fn open_in(dir: impl AsRef<Path>, label: &str) -> std::io::Result<Self> {
            let dir = dir.as_ref();
            fs::create_dir_all(dir)?;
            let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

            for n in 0..MAX_NAME_ATTEMPTS {
                let name = if n == 0 {
                    format!("{label}-{stamp}.log")
                } else {
                    format!("{label}-{stamp}({n}).log")
                };
                let path = dir.join(name);
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(file) => {
                        return Ok(Self {
                            writer: Mutex::new(LineWriter::new(file)),
                            path,
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "no free session log filename",
            ))
        }

        /// Appends one timestamped line. Logging failures are reported and
        /// swallowed; diagnostics never fail an operation.
        pub fn message(&self, text: &str) {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let outcome = match self.writer.lock() {
                Ok(mut writer) => writeln!(writer, "{stamp} : {text}"),
                Err(_) => return,
            };
            if let Err(e) = outcome {
                warn!("session log write failed: {e}");
            }
        }

        /// Path of the backing log file.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }
}

#[cfg(feature = "diagnostics")]
pub use session::SessionLog;

/// Mirrors one operation event into the connection's session log.
macro_rules! diag {
    ($log:expr, $($arg:tt)+) => {
        #[cfg(feature = "diagnostics")]
        if let Some(log) = $log.as_ref() {
            log.message(&format!($($arg)+));
        }
    };
}

pub(crate) use diag;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(all(test, feature = "diagnostics"))]
mod tests {
    use super::SessionLog;

    fn temp_log_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("botwire-diag-test-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_message_appends_timestamped_lines() {
        // Arrange
        let dir = temp_log_dir("message");
        let log = SessionLog::open_in(&dir, "session").expect("open log");
        let path = log.path().to_path_buf();

        // Act
        log.message("read_line timeout=250ms");
        log.message("line received (4 bytes)");
        drop(log);

        // Assert – one line per message, "stamp : text"
        let contents = std::fs::read_to_string(&path).expect("read log file");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" : read_line timeout=250ms"));
        assert!(lines[1].ends_with(" : line received (4 bytes)"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sessions_opened_in_the_same_second_get_distinct_files() {
        let dir = temp_log_dir("collision");

        let first = SessionLog::open_in(&dir, "session").expect("first log");
        let second = SessionLog::open_in(&dir, "session").expect("second log");

        assert_ne!(first.path(), second.path());

        std::fs::remove_dir_all(&dir).ok();
    }
}
