//! Log capture: hook log tailing, container output pumping and display helpers.
//!
//! Two producers run per session while the agent container is alive. The file
//! tail follows the hook log written inside the container through a bind
//! mount; the output pump drains the container's stdout/stderr. Both write
//! straight to the session log table.

use ags_local_db::{LogLevel, LogSource, NewLogEntry};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::container::{ContainerEngine, OutputStream};
use crate::db::DatabaseManager;

/// Writes log entries for one session.
///
/// Storage failures are reported through `tracing` and never abort capture.
#[derive(Debug, Clone)]
pub struct LogSink {
    db: DatabaseManager,
    session: String,
}

impl LogSink {
    pub fn new(db: DatabaseManager, session: impl Into<String>) -> Self {
        Self {
            db,
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn record(&self, entry: NewLogEntry) {
        if let Err(e) = self.db.append_log(&self.session, &entry) {
            tracing::warn!(session = %self.session, error = %e, "Failed to store log entry");
        }
    }

    /// Orchestration progress, mirrored to `tracing`.
    pub fn system(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        trace_message(&self.session, level, &message);
        self.record(NewLogEntry::message(level, message).with_source(LogSource::System));
    }

    /// Workspace provisioning and cleanup messages, mirrored to `tracing`.
    pub fn workspace(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        trace_message(&self.session, level, &message);
        self.record(NewLogEntry::message(level, message).with_source(LogSource::Workspace));
    }
}

fn trace_message(session: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(session = %session, "{}", message),
        LogLevel::Warn => tracing::warn!(session = %session, "{}", message),
        _ => tracing::info!(session = %session, "{}", message),
    }
}

/// Convert a hook event timestamp to the stored format.
///
/// Accepts RFC 3339 and naive ISO 8601 (treated as UTC).
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let format = ags_local_db::TIMESTAMP_FORMAT;
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&chrono::Utc).format(format).to_string());
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().format(format).to_string())
}

/// Parse one line of the hook log.
///
/// JSON objects carrying `tool_name` become `TOOL` entries; any other line is
/// kept as an `INFO` message.
pub fn parse_hook_line(line: &str) -> NewLogEntry {
    let trimmed = line.trim();
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(_) => {
            return NewLogEntry::info(trimmed)
                .with_source(LogSource::Hook)
                .with_raw(line);
        }
    };

    let tool_name = value.get("tool_name").and_then(Value::as_str);
    match tool_name {
        Some(tool) => {
            let tool_input = value
                .get("tool_input")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            let hook_event = value
                .get("hook_event_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            NewLogEntry {
                timestamp: value
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(normalize_timestamp),
                level: LogLevel::Tool,
                message: Some(describe_tool_event(tool, &tool_input)),
                tool_name: Some(tool.to_string()),
                hook_event: Some(hook_event.to_string()),
                tool_input: Some(tool_input.to_string()),
                source: Some(LogSource::Hook),
                raw_log: Some(line.to_string()),
            }
        }
        None => NewLogEntry::info(value.to_string())
            .with_source(LogSource::Hook)
            .with_raw(line),
    }
}

fn shorten_path(path: &str) -> &str {
    path.strip_prefix("/workspace/").unwrap_or(path)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// One-line human readable summary of a tool invocation.
pub fn describe_tool_event(tool_name: &str, tool_input: &Value) -> String {
    let field = |key: &str, default: &'static str| -> String {
        tool_input
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    match tool_name {
        "TodoWrite" => {
            let todos = tool_input
                .get("todos")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let count = |status: &str| {
                todos
                    .iter()
                    .filter(|t| t.get("status").and_then(Value::as_str) == Some(status))
                    .count()
            };
            format!(
                "Todos: {} total ({} pending, {} in progress, {} completed)",
                todos.len(),
                count("pending"),
                count("in_progress"),
                count("completed")
            )
        }
        "Read" => format!("Reading: {}", shorten_path(&field("file_path", "unknown"))),
        "Write" => format!("Writing: {}", shorten_path(&field("file_path", "unknown"))),
        "Edit" | "MultiEdit" => {
            format!("Editing: {}", shorten_path(&field("file_path", "unknown")))
        }
        "Bash" => {
            let command = truncate_chars(&field("command", "unknown"), 100);
            let compact = command.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("Running: {}", compact)
        }
        "Task" => field("description", "unknown"),
        "WebSearch" => format!("Searching: {}", truncate_chars(&field("query", "unknown"), 80)),
        "WebFetch" => format!("Fetching: {}", field("url", "unknown")),
        "Grep" => format!(
            "Searching for: '{}' in {}",
            truncate_chars(&field("pattern", "unknown"), 50),
            shorten_path(&field("path", "."))
        ),
        "Glob" => format!(
            "Finding: '{}' in {}",
            field("pattern", "unknown"),
            shorten_path(&field("path", "."))
        ),
        "LS" => format!("Listing: {}", shorten_path(&field("path", "unknown"))),
        _ => "Executing".to_string(),
    }
}

/// Split complete lines off the front of `pending`, leaving any partial line.
fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
    }
    lines
}

fn take_remainder(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let rest = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    Some(rest)
}

/// Follow the hook log until the container stops producing output.
///
/// `file` must already be positioned where reading should start. When no new
/// data is available the container status is checked; capture continues
/// while it is created or running and ends with a final drain otherwise.
/// Returns the number of entries recorded.
pub async fn tail_log_file(
    engine: Arc<dyn ContainerEngine>,
    container: String,
    mut file: tokio::fs::File,
    sink: LogSink,
    poll_interval: Duration,
) -> crate::Result<usize> {
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 8192];
    let mut recorded = 0;

    let mut record_lines = |pending: &mut Vec<u8>, final_pass: bool| {
        let mut lines = take_lines(pending);
        if final_pass {
            lines.extend(take_remainder(pending));
        }
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            sink.record(parse_hook_line(&line));
            recorded += 1;
        }
    };

    loop {
        let n = file.read(&mut buf).await?;
        if n > 0 {
            pending.extend_from_slice(&buf[..n]);
            record_lines(&mut pending, false);
            continue;
        }

        match engine.container_status(&container).await {
            Ok(status) if status.is_active() => tokio::time::sleep(poll_interval).await,
            Ok(_) => break,
            Err(e) => {
                tracing::warn!(
                    container = %container,
                    error = %e,
                    "Stopping log tail: status check failed"
                );
                break;
            }
        }
    }

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
    }
    record_lines(&mut pending, true);

    tracing::debug!(container = %container, entries = recorded, "Hook log tail finished");
    Ok(recorded)
}

/// Store each non-empty line of a container output stream as an `INFO` entry.
///
/// Returns the number of entries recorded once the stream ends.
pub async fn pump_output(mut stream: OutputStream, sink: LogSink) -> usize {
    let mut pending = Vec::new();
    let mut recorded = 0;

    let mut record = |line: String| {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        sink.record(
            NewLogEntry::info(line)
                .with_source(LogSource::Container)
                .with_raw(line),
        );
        recorded += 1;
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                pending.extend_from_slice(&bytes);
                for line in take_lines(&mut pending) {
                    record(line);
                }
            }
            Err(e) => {
                tracing::warn!(
                    session = %sink.session(),
                    error = %e,
                    "Container output stream failed"
                );
                break;
            }
        }
    }
    if let Some(rest) = take_remainder(&mut pending) {
        record(rest);
    }

    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerSpec, ContainerStatus, EngineError};
    use ags_local_db::NewSession;
    use serde_json::json;
    use std::io::{SeekFrom, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncSeekExt;

    #[test]
    fn test_parse_tool_event() {
        let line = r#"{"timestamp":"2024-05-01T10:00:00.123Z","tool_name":"Write","hook_event_name":"PreToolUse","tool_input":{"file_path":"/workspace/hello.py","content":"x"}}"#;
        let entry = parse_hook_line(line);

        assert_eq!(entry.level, LogLevel::Tool);
        assert_eq!(entry.tool_name.as_deref(), Some("Write"));
        assert_eq!(entry.hook_event.as_deref(), Some("PreToolUse"));
        assert_eq!(entry.timestamp.as_deref(), Some("2024-05-01T10:00:00.123000Z"));
        assert_eq!(entry.message.as_deref(), Some("Writing: hello.py"));
        let input: Value = serde_json::from_str(entry.tool_input.as_deref().unwrap()).unwrap();
        assert_eq!(input["file_path"], "/workspace/hello.py");
        assert_eq!(entry.raw_log.as_deref(), Some(line));
    }

    #[test]
    fn test_parse_json_without_tool_is_info() {
        let entry = parse_hook_line(r#"{"event": "stop"}"#);
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message.as_deref(), Some(r#"{"event":"stop"}"#));
        assert!(entry.tool_name.is_none());
    }

    #[test]
    fn test_parse_plain_text() {
        let entry = parse_hook_line("  starting agent  ");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message.as_deref(), Some("starting agent"));
        assert_eq!(entry.source, Some(LogSource::Hook));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2024-05-01T12:00:00+02:00").as_deref(),
            Some("2024-05-01T10:00:00.000000Z")
        );
        assert_eq!(
            normalize_timestamp("2024-05-01T10:00:00.5").as_deref(),
            Some("2024-05-01T10:00:00.500000Z")
        );
        assert!(normalize_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_describe_tool_events() {
        let todos = json!({"todos": [
            {"status": "pending"},
            {"status": "completed"},
            {"status": "in_progress"},
            {"status": "pending"}
        ]});
        assert_eq!(
            describe_tool_event("TodoWrite", &todos),
            "Todos: 4 total (2 pending, 1 in progress, 1 completed)"
        );
        assert_eq!(
            describe_tool_event("Bash", &json!({"command": "cargo   test\n  --all"})),
            "Running: cargo test --all"
        );
        assert_eq!(
            describe_tool_event("Grep", &json!({"pattern": "fn main", "path": "/workspace/src"})),
            "Searching for: 'fn main' in src"
        );
        assert_eq!(describe_tool_event("Unknown", &json!({})), "Executing");
    }

    #[test]
    fn test_take_lines_keeps_partial_line() {
        let mut pending = b"one\ntwo\nthr".to_vec();
        assert_eq!(take_lines(&mut pending), vec!["one", "two"]);
        assert_eq!(pending, b"thr");
        pending.extend_from_slice(b"ee\n");
        assert_eq!(take_lines(&mut pending), vec!["three"]);
        assert!(take_remainder(&mut pending).is_none());
    }

    /// Engine whose only working call is `container_status`.
    struct StatusEngine {
        running: AtomicBool,
        status_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ContainerEngine for StatusEngine {
        async fn image_exists(&self, _tag: &str) -> Result<bool, EngineError> {
            Ok(true)
        }
        async fn build_image(&self, _: &Path, _: &Path, _: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn ensure_network(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn remove_network(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn ensure_volume(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
            Ok(spec.name.clone())
        }
        async fn start_container(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn container_status(&self, _name: &str) -> Result<ContainerStatus, EngineError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if self.running.load(Ordering::SeqCst) {
                Ok(ContainerStatus::Running)
            } else {
                Ok(ContainerStatus::NotFound)
            }
        }
        fn output_stream(&self, _name: &str) -> OutputStream {
            futures::stream::empty().boxed()
        }
        async fn container_output(&self, _name: &str) -> Result<String, EngineError> {
            Ok(String::new())
        }
        async fn wait_container(&self, name: &str) -> Result<i64, EngineError> {
            Err(EngineError::NotFound(name.to_string()))
        }
        async fn stop_container(&self, _name: &str, _timeout: i64) -> Result<(), EngineError> {
            Ok(())
        }
        async fn run_interactive(&self, _spec: &ContainerSpec) -> Result<i64, EngineError> {
            Ok(0)
        }
        async fn remove_container(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn list_containers_by_image(&self, _: &str) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_tail_follows_appends_until_container_is_gone() {
        let db = DatabaseManager::in_memory().unwrap();
        db.create_session(&NewSession {
            name: "s1".to_string(),
            project: "demo".to_string(),
            goal: "add hello()".to_string(),
            phase: "implementation".to_string(),
            result_kind: "diff".to_string(),
            target_files: None,
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.log");
        std::fs::write(&path, "written before the tail started\n").unwrap();
        let mut file = tokio::fs::File::open(&path).await.unwrap();
        file.seek(SeekFrom::End(0)).await.unwrap();

        let engine = Arc::new(StatusEngine {
            running: AtomicBool::new(true),
            status_calls: AtomicUsize::new(0),
        });
        let tail = tokio::spawn(tail_log_file(
            engine.clone(),
            "agent-s1".to_string(),
            file,
            LogSink::new(db.clone(), "s1"),
            Duration::from_millis(10),
        ));

        let mut writer = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let event = r#"{"tool_name":"LS","tool_input":{"path":"/workspace/src"}}"#;
        writeln!(writer, "{}", event).unwrap();
        write!(writer, "partial").unwrap();
        writer.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writeln!(writer, " line done").unwrap();
        writer.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.running.store(false, Ordering::SeqCst);

        let recorded = tokio::time::timeout(Duration::from_secs(5), tail)
            .await
            .expect("tail did not stop after the container was gone")
            .unwrap()
            .unwrap();
        assert_eq!(recorded, 2);

        let logs = db.list_logs("s1").unwrap();
        let messages: Vec<_> = logs.iter().filter_map(|l| l.message.as_deref()).collect();
        assert_eq!(messages, vec!["Listing: src", "partial line done"]);
        assert!(engine.status_calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_take_lines_decodes_invalid_utf8_lossily() {
        let mut pending = vec![b'o', b'k', 0xff, b'\n'];
        let lines = take_lines(&mut pending);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }
}
