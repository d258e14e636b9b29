use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::debug::json_escape;

pub const DEFAULT_PERF_LOG: &str = "bandlist_perf.log";

/// Span timings and counters for the writer's slow paths (flushes,
/// recoveries, page completion). Dropping the last clone writes a ranked
/// `<stem>_hot.log` next to the log.
#[derive(Clone)]
pub struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

#[derive(Default)]
struct Totals {
    span_ms: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
    counts: HashMap<String, u64>,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    totals: Totals,
}

fn page_json(page: Option<usize>) -> String {
    page.map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                totals: Totals::default(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, page: Option<usize>, ms: f64) {
        let json = format!(
            "{{\"type\":\"perf.span\",\"name\":\"{}\",\"page\":{},\"unit\":\"ms\",\"ms\":{:.3}}}",
            json_escape(name),
            page_json(page),
            ms
        );
        if let Ok(mut state) = self.inner.lock() {
            *state.totals.span_ms.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.totals.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{json}");
        }
    }

    /// Logs the time elapsed since `started` as a span.
    pub fn log_since(&self, name: &str, page: Option<usize>, started: Instant) {
        self.log_span_ms(name, page, started.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn log_counts(&self, name: &str, page: Option<usize>, counts: &[(&str, u64)]) {
        let body = counts
            .iter()
            .map(|(key, value)| format!("\"{}\":{}", json_escape(key), value))
            .collect::<Vec<_>>()
            .join(",");
        let json = format!(
            "{{\"type\":\"perf.counts\",\"name\":\"{}\",\"page\":{},\"counts\":{{{}}}}}",
            json_escape(name),
            page_json(page),
            body
        );
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let entry = state.totals.counts.entry(format!("{name}.{key}")).or_insert(0);
                *entry = entry.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn span_count(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.totals.span_counts.get(name).copied())
            .unwrap_or(0)
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

impl std::fmt::Debug for PerfLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfLogger").finish_non_exhaustive()
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let Ok(file) = File::create(hot_path_for(&self.path)) else {
            return;
        };
        let _ = write_hot_log(&mut BufWriter::new(file), &self.totals);
    }
}

fn write_hot_log(writer: &mut impl Write, totals: &Totals) -> io::Result<()> {
    let mut spans: Vec<(&String, &f64)> = totals.span_ms.iter().collect();
    spans.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (rank, (name, ms)) in spans.into_iter().take(50).enumerate() {
        let count = totals.span_counts.get(name).copied().unwrap_or(1).max(1);
        writeln!(
            writer,
            "{{\"type\":\"perf.hot.span\",\"rank\":{},\"name\":\"{}\",\"ms\":{:.3},\"count\":{},\"avg_ms\":{:.3}}}",
            rank + 1,
            json_escape(name),
            ms,
            count,
            ms / count as f64
        )?;
    }
    let mut counts: Vec<(&String, &u64)> = totals.counts.iter().collect();
    counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (rank, (name, value)) in counts.into_iter().take(50).enumerate() {
        writeln!(
            writer,
            "{{\"type\":\"perf.hot.count\",\"rank\":{},\"name\":\"{}\",\"value\":{}}}",
            rank + 1,
            json_escape(name),
            value
        )?;
    }
    writer.flush()
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_PERF_LOG);
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}
