use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

const LOG_FILE: &str = "gateway.log";
const MAX_BYTES: u64 = 5 * 1024 * 1024;
const MAX_BACKUPS: u32 = 10;

/// Matches the level column of a log line, e.g. `2026-08-01T10:00:00Z [ERROR] …`.
static ERROR_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\S+ \[ERROR\]").unwrap());

/// The interaction log: one line per REQUEST and per RESPONSE (plus ERROR
/// lines for failures), written to a rotating text file. When the active
/// file would exceed the size cap it is shifted to `.1`, prior backups move
/// `.N → .N+1`, and `.10` falls off the end.
///
/// Writes are synchronous and short; they are never made while the governor
/// lock is held.
pub struct InteractionLog {
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
    write_lock: Mutex<()>,
}

impl InteractionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_limits(dir, MAX_BYTES, MAX_BACKUPS)
    }

    pub fn with_limits(dir: impl Into<PathBuf>, max_bytes: u64, backups: u32) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::error!("❌ [Log] cannot create log directory {}: {}", dir.display(), e);
        }
        Self { path: dir.join(LOG_FILE), max_bytes, backups, write_lock: Mutex::new(()) }
    }

    /// Records the raw inbound body, before any parsing.
    pub fn request(&self, id: &str, raw_body: &str) {
        self.write_line("INFO", &format!("REQUEST id={} body={}", id, raw_body));
    }

    pub fn response(&self, id: &str, status: u16, body: &str) {
        self.write_line("INFO", &format!("RESPONSE id={} status={} body={}", id, status, body));
    }

    pub fn error(&self, id: &str, detail: &str) {
        self.write_line("ERROR", &format!("id={} {}", id, detail));
    }

    fn write_line(&self, level: &str, message: &str) {
        // one entry per line; the error-window scan below depends on it
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level,
            message.replace('\n', "\\n"),
        );

        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current > 0 && current + line.len() as u64 > self.max_bytes {
            self.rotate();
        }
        let opened = OpenOptions::new().create(true).append(true).open(&self.path);
        match opened {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    tracing::error!("❌ [Log] write to {} failed: {}", self.path.display(), e);
                }
            }
            Err(e) => tracing::error!("❌ [Log] cannot open {}: {}", self.path.display(), e),
        }
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(format!(".{}", n));
        PathBuf::from(os)
    }

    /// Shift `.N → .N+1` (the oldest backup falls off), then move the active
    /// file to `.1`. Caller holds `write_lock`.
    fn rotate(&self) {
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                let to = self.backup_path(n + 1);
                if let Err(e) = fs::rename(&from, &to) {
                    tracing::error!("❌ [Log] rotation {} → {} failed: {}", from.display(), to.display(), e);
                }
            }
        }
        if let Err(e) = fs::rename(&self.path, self.backup_path(1)) {
            tracing::error!("❌ [Log] rotation of {} failed: {}", self.path.display(), e);
        }
    }

    /// The most recent error windows in the active file, newest first.
    /// A window is the error line plus up to two preceding lines of context.
    pub fn error_windows(&self, max_windows: usize) -> Vec<String> {
        let content = fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();

        let mut windows = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if ERROR_LINE.is_match(line) {
                let start = i.saturating_sub(2);
                windows.push(lines[start..=i].join("\n"));
            }
        }
        windows.into_iter().rev().take(max_windows).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_dir() -> PathBuf {
        std::env::temp_dir().join(format!("gateway_log_test_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_request_and_response_lines_are_appended() {
        let dir = temp_log_dir();
        let log = InteractionLog::new(&dir);

        log.request("req-1", r#"{"model":"m","messages":[]}"#);
        log.response("req-1", 200, r#"{"choices":[]}"#);

        let content = fs::read_to_string(dir.join(LOG_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] REQUEST id=req-1"));
        assert!(lines[1].contains("RESPONSE id=req-1 status=200"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let dir = temp_log_dir();
        // tiny cap so a handful of writes triggers several rotations
        let log = InteractionLog::with_limits(&dir, 120, 3);

        for i in 0..12 {
            log.request(&format!("req-{}", i), "0123456789012345678901234567890123456789");
        }

        assert!(dir.join(LOG_FILE).exists());
        assert!(dir.join(format!("{}.1", LOG_FILE)).exists());
        assert!(dir.join(format!("{}.2", LOG_FILE)).exists());
        assert!(dir.join(format!("{}.3", LOG_FILE)).exists());
        assert!(
            !dir.join(format!("{}.4", LOG_FILE)).exists(),
            "backups past the cap must be dropped"
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_error_windows_include_context_newest_first() {
        let dir = temp_log_dir();
        let log = InteractionLog::new(&dir);

        log.request("a", "{}");
        log.response("a", 200, "ok");
        log.error("a", "upstream 500: first failure");
        log.request("b", "{}");
        log.error("b", "upstream 502: second failure");

        let windows = log.error_windows(10);
        assert_eq!(windows.len(), 2);
        // newest first
        assert!(windows[0].contains("second failure"));
        assert!(windows[1].contains("first failure"));
        // each window carries up to two preceding lines
        assert_eq!(windows[1].lines().count(), 3);
        assert!(windows[1].contains("REQUEST id=a"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_error_window_cap() {
        let dir = temp_log_dir();
        let log = InteractionLog::new(&dir);
        for i in 0..15 {
            log.error("x", &format!("failure {}", i));
        }
        let windows = log.error_windows(10);
        assert_eq!(windows.len(), 10);
        assert!(windows[0].contains("failure 14"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_multiline_bodies_stay_on_one_line() {
        let dir = temp_log_dir();
        let log = InteractionLog::new(&dir);
        log.request("a", "line one\nline two");

        let content = fs::read_to_string(dir.join(LOG_FILE)).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("line one\\nline two"));

        let _ = fs::remove_dir_all(&dir);
    }
}
