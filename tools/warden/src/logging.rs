use crate::errors::WardenError;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub unix_ms: u128,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), WardenError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| WardenError::Io(e.to_string()))?;
            }
        }
        let line = serde_json::to_string(&LogEvent {
            unix_ms: event.unix_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| WardenError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WardenError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| WardenError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| WardenError::Io(e.to_string()))
    }
}

struct RunLog {
    min_level: LogLevel,
    sink: Option<JsonlLogger>,
}

static RUN_LOG: OnceLock<RunLog> = OnceLock::new();

/// Installs the process-wide run log. Only the first call takes effect; later calls
/// return `false` and leave the installed log untouched.
pub fn install_run_log(min_level: LogLevel, log_file: Option<&Path>) -> bool {
    RUN_LOG
        .set(RunLog {
            min_level,
            sink: log_file.map(JsonlLogger::new),
        })
        .is_ok()
}

/// Emits one structured event to stderr and, when installed, to the JSONL run log.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let run_log = RUN_LOG.get();
    let min_level = run_log.map_or(LogLevel::Info, |log| log.min_level);
    if LogLevel::parse(level).unwrap_or(LogLevel::Info) < min_level {
        return;
    }

    eprintln!("{}", structured_fallback_line(level, event_type, &payload));

    let Some(sink) = run_log.and_then(|log| log.sink.as_ref()) else {
        return;
    };
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let event = LogEvent {
        unix_ms,
        level,
        event_type,
        payload,
    };
    if let Err(error) = sink.append(&event) {
        eprintln!(
            "{}",
            structured_fallback_line(
                "error",
                "log.append_failed",
                &json!({
                    "path": sink.path.display().to_string(),
                    "error": error.to_string()
                })
            )
        );
    }
}

pub fn structured_fallback_line(level: &str, event_type: &str, payload: &Value) -> String {
    format!("level={level} event={event_type} {payload}")
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{structured_fallback_line, JsonlLogger, LogEvent, LogLevel};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("warden.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                unix_ms: 1,
                level: "warn",
                event_type: "heartbeat.stale",
                payload: json!({"path": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");
        logger
            .append(&LogEvent {
                unix_ms: 2,
                level: "info",
                event_type: "supervisor.exited",
                payload: json!({"code": 0}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event_type\":\"heartbeat.stale\""));
        assert!(lines[0].contains("..."));
        assert!(lines[1].contains("\"code\":0"));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("warn", "heartbeat.missing", &json!({"path": "hb"}));
        assert_eq!(line, "level=warn event=heartbeat.missing {\"path\":\"hb\"}");
    }

    #[test]
    fn levels_parse_and_order() {
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("loud"), None);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
