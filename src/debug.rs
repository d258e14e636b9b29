use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// JSON-lines sink for writer events, with named counters summarised on
/// demand. Cloning shares the sink.
#[derive(Clone)]
pub struct DebugLogger {
    inner: Arc<Mutex<DebugState>>,
}

struct DebugState {
    writer: BufWriter<File>,
    counters: HashMap<String, u64>,
    lines: u64,
}

impl DebugLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(DebugState {
                writer: BufWriter::new(file),
                counters: HashMap::new(),
                lines: 0,
            })),
        })
    }

    pub fn log_json(&self, json: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{json}");
            state.lines += 1;
        }
    }

    /// Writes `{"type":<kind>,"page":<page>,...fields}` with numeric fields.
    pub fn log_event(&self, kind: &str, page: usize, fields: &[(&str, u64)]) {
        let mut json = format!(
            "{{\"type\":\"{}\",\"page\":{}",
            json_escape(kind),
            page
        );
        for (key, value) in fields {
            json.push_str(&format!(",\"{}\":{}", json_escape(key), value));
        }
        json.push('}');
        self.log_json(&json);
    }

    pub fn increment(&self, key: &str, amount: u64) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.counters.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.counters.get(key).copied())
            .unwrap_or(0)
    }

    pub fn lines_written(&self) -> u64 {
        self.inner.lock().map(|state| state.lines).unwrap_or(0)
    }

    /// Writes one summary line with every counter and resets them.
    pub fn emit_summary(&self, context: &str) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let mut counters: Vec<(String, u64)> = state.counters.drain().collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        let counts = counters
            .iter()
            .map(|(key, value)| format!("\"{}\":{}", json_escape(key), value))
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(
            state.writer,
            "{{\"type\":\"debug.summary\",\"context\":\"{}\",\"counts\":{{{}}}}}",
            json_escape(context),
            counts
        );
        state.lines += 1;
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

impl std::fmt::Debug for DebugLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugLogger")
            .field("lines", &self.lines_written())
            .finish()
    }
}

pub(crate) fn json_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_and_summary_are_json_lines() {
        let path = std::env::temp_dir().join(format!(
            "bandlist_debug_{}_{:?}.log",
            std::process::id(),
            std::thread::current().id()
        ));
        let logger = DebugLogger::new(&path).unwrap();
        logger.log_event("clist.flush", 2, &[("runs", 3), ("bytes", 40)]);
        logger.increment("clist.flush", 1);
        logger.increment("clist.flush", 2);
        assert_eq!(logger.counter("clist.flush"), 3);
        logger.emit_summary("page \"2\"");
        logger.flush();
        assert_eq!(logger.counter("clist.flush"), 0);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "{\"type\":\"clist.flush\",\"page\":2,\"runs\":3,\"bytes\":40}"
        );
        assert_eq!(
            lines[1],
            "{\"type\":\"debug.summary\",\"context\":\"page \\\"2\\\"\",\"counts\":{\"clist.flush\":3}}"
        );
        let _ = std::fs::remove_file(&path);
    }
}
