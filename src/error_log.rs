use std::fs::OpenOptions;
use std::io::Write;
use std::panic::Location;
use std::path::{Path, PathBuf};

/// Append-only log of failed attempts and fatal aborts for operators.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    path: Option<PathBuf>,
}

impl ErrorLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one failure with its full cause chain. Never fails.
    #[track_caller]
    pub fn record(&self, attempt: u32, error: &(dyn std::error::Error + 'static)) {
        let location = Location::caller();
        let line = format_entry(attempt, location, error);
        log::error!("{line}");

        let Some(path) = &self.path else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));
        if let Err(e) = written {
            log::warn!("Failed to write error log {}: {e}", path.display());
        }
    }
}

fn format_entry(attempt: u32, location: &Location<'_>, error: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        // Causes already spelled out by the outer message are not repeated.
        let text = cause.to_string();
        if !chain.contains(&text) {
            chain.push_str(": caused by: ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    format!(
        "{} attempt={} at={}:{} error={}",
        chrono::Local::now().to_rfc3339(),
        attempt,
        location.file(),
        location.line(),
        chain
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("delivery failed")]
    struct Outer {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn test_record_appends_with_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let log = ErrorLog::new(Some(path.clone()));
        let error = Outer {
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        log.record(1, &error);
        log.record(2, &error);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("attempt=1"));
        assert!(lines[1].contains("attempt=2"));
        assert!(lines[0].contains("error_log.rs:"));
        assert!(lines[0].ends_with("error=delivery failed: caused by: disk full"));
    }

    #[test]
    fn test_unwritable_path_is_ignored() {
        let log = ErrorLog::new(Some(PathBuf::from("/nonexistent/dir/errors.log")));
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        log.record(1, &error);
    }

    #[test]
    fn test_cause_in_message_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let log = ErrorLog::new(Some(path.clone()));
        let error = crate::pipeline::PipelineError::from(crate::delivery::DeliveryError::Io {
            context: "writing spool file".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        });
        log.record(1, &error);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("disk full").count(), 1);
        assert!(content.contains("error=I/O error during writing spool file: disk full\n"));
    }
}
