//! JSONL event log.
//!
//! A tracing [`Layer`] that appends one JSON object per event to
//! `<dir>/<date>_<client>.jsonl`. Each client (one identity, one process or
//! one simulated account) writes its own file, so several of them can run
//! side by side without interleaving lines.
//!
//! ```text
//! logs/
//! ├── 2026-10-18_alice.jsonl
//! └── 2026-10-18_bob.jsonl
//! ```
//!
//! ```bash
//! jq 'select(.level == "warn") | .fields.node' logs/*.jsonl
//! ```

use std::fmt::Write as FmtWrite;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// One line of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    pub level: String,
    pub client: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

/// Appends [`LogEntry`] lines for one client.
pub struct JsonlLayer {
    client: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLayer {
    pub fn new(dir: impl AsRef<Path>, client: impl Into<String>) -> std::io::Result<Self> {
        let client = client.into();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = dir.join(format!("{}_{}.jsonl", date, client));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            client,
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let span = ctx.event_scope(event).map(|scope| {
            scope
                .from_root()
                .map(|span| span.name())
                .collect::<Vec<_>>()
                .join(" > ")
        });
        let entry = LogEntry {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: metadata.level().as_str().to_lowercase(),
            client: self.client.clone(),
            target: metadata.target().to_string(),
            msg: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            span: span.filter(|s| !s.is_empty()),
        };
        // Logging must never take the client down.
        let _ = self.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Filter for `-v` counts: warn, info, debug, then trace. `RUST_LOG` wins
/// when set.
pub fn verbosity_filter(verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Read back every entry of a JSONL log file, skipping malformed lines.
pub fn read_entries(path: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_jsonl_layer_captures_events() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path().join("logs"), "alice").unwrap();
        let path = layer.path().to_path_buf();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("poll");
            let _guard = span.enter();
            tracing::info!("Poll started");
            tracing::warn!(failures = 3u64, node = "10.0.0.1:22021", "Evicting snode");
        });

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].msg, "Poll started");
        assert_eq!(entries[0].level, "info");
        assert_eq!(entries[0].client, "alice");
        assert_eq!(entries[0].span.as_deref(), Some("poll"));
        assert_eq!(entries[1].fields["failures"], Value::from(3u64));
        assert_eq!(entries[1].fields["node"], Value::from("10.0.0.1:22021"));
    }

    #[test]
    fn test_read_entries_skips_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");
        fs::write(
            &path,
            "not json\n{\"ts\":\"t\",\"level\":\"info\",\"client\":\"c\",\"target\":\"x\",\"msg\":\"ok\"}\n",
        )
        .unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fields.is_empty());
    }
}
