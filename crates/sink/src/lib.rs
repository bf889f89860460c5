//! Courier sink: append-only dispatch records and the audit trail.
//! Plain files, opened per call. Nothing here ever truncates.

#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use courier_core::{Order, TIME_FORMAT};
use metrics::{counter, histogram};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("writing {target} ({path}): {source}")]
    Io {
        target: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait ResultSink: Send + Sync {
    /// Append one record line per order. Returns the number of lines written.
    fn persist(&self, batch: &[Arc<Order>]) -> Result<usize, SinkError>;
    /// Append `<timestamp>: <message>` to the audit trail.
    fn audit(&self, message: &str) -> Result<(), SinkError>;
}

pub fn audit_line(message: &str) -> String {
    format!("{}: {}", chrono::Local::now().format(TIME_FORMAT), message)
}

fn render_batch(batch: &[Arc<Order>]) -> String {
    let mut buf = String::with_capacity(batch.len() * 64);
    for o in batch {
        buf.push_str(&o.record_line());
        buf.push('\n');
    }
    buf
}

/// File-backed sink writing results and audit lines to two configured paths.
pub struct FileSink {
    result_path: PathBuf,
    log_path: PathBuf,
    // One writer at a time per sink so concurrent batches never interleave.
    results: Mutex<()>,
    log: Mutex<()>,
}

impl FileSink {
    pub fn new(result_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self { result_path: result_path.into(), log_path: log_path.into(), results: Mutex::new(()), log: Mutex::new(()) }
    }

    fn append(target: &'static str, path: &Path, bytes: &[u8], sync: bool) -> Result<(), SinkError> {
        let io_err = |source| SinkError::Io { target, path: path.display().to_string(), source };
        let mut f = OpenOptions::new().create(true).append(true).open(path).map_err(io_err)?;
        // Single write of the whole buffer keeps each batch contiguous in the file.
        f.write_all(bytes).map_err(io_err)?;
        f.flush().map_err(io_err)?;
        if sync {
            f.sync_data().map_err(io_err)?;
        }
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn persist(&self, batch: &[Arc<Order>]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let buf = render_batch(batch);
        let _guard = self.results.lock().unwrap_or_else(|e| e.into_inner());
        let res = Self::append("results", &self.result_path, buf.as_bytes(), true);
        drop(_guard);
        histogram!("sink_persist_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("sink_lines_total", batch.len() as u64);
                debug!(lines = batch.len(), path = %self.result_path.display(), "sink: batch persisted");
                Ok(batch.len())
            }
            Err(e) => {
                counter!("sink_errors_total", 1u64);
                warn!(error = %e, "sink: persist failed");
                Err(e)
            }
        }
    }

    fn audit(&self, message: &str) -> Result<(), SinkError> {
        let mut line = audit_line(message);
        line.push('\n');
        let _guard = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Self::append("audit log", &self.log_path, line.as_bytes(), false).map_err(|e| {
            counter!("sink_errors_total", 1u64);
            warn!(error = %e, "sink: audit failed");
            e
        })
    }
}

/// In-process sink. Used for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<String>>,
    audits: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<String> { self.records.lock().unwrap_or_else(|e| e.into_inner()).clone() }
    pub fn audits(&self) -> Vec<String> { self.audits.lock().unwrap_or_else(|e| e.into_inner()).clone() }
}

impl ResultSink for MemorySink {
    fn persist(&self, batch: &[Arc<Order>]) -> Result<usize, SinkError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.extend(batch.iter().map(|o| o.record_line()));
        Ok(batch.len())
    }

    fn audit(&self, message: &str) -> Result<(), SinkError> {
        self.audits.lock().unwrap_or_else(|e| e.into_inner()).push(audit_line(message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::parse_timestamp;

    fn temp_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir();
        let f = format!("courier-{}-{}.txt", tag, std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f)
    }

    fn batch() -> Vec<Arc<Order>> {
        vec![
            Arc::new(Order::new(5.0, "North", parse_timestamp("2024-01-01 10:00:00").unwrap()).unwrap()),
            Arc::new(Order::new(3.5, "North", parse_timestamp("2024-01-01 10:20:00").unwrap()).unwrap()),
        ]
    }

    #[test]
    fn persist_appends_never_truncates() {
        let results = temp_path("results");
        let log = temp_path("log");
        let sink = FileSink::new(&results, &log);
        let b = batch();
        assert_eq!(sink.persist(&b).unwrap(), 2);
        assert_eq!(sink.persist(&b).unwrap(), 2);
        let body = std::fs::read_to_string(&results).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], b[0].record_line());
        assert_eq!(lines[1], b[1].record_line());
        assert_eq!(lines[2..], lines[..2], "second copy is identical");
        assert!(lines[1].ends_with(";3.5;North;2024-01-01 10:20:00"));
        let _ = std::fs::remove_file(results);
    }

    #[test]
    fn audit_lines_are_timestamped() {
        let log = temp_path("log");
        let sink = FileSink::new(temp_path("results"), &log);
        sink.audit("orders loaded").unwrap();
        sink.audit("second").unwrap();
        let body = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let (stamp, msg) = lines[0].split_once(": ").unwrap();
        assert!(parse_timestamp(stamp).is_some(), "stamp={}", stamp);
        assert_eq!(msg, "orders loaded");
        let _ = std::fs::remove_file(log);
    }

    #[test]
    fn unwritable_target_is_io_error_and_keeps_prior_lines() {
        let results = temp_path("results");
        let sink = FileSink::new(&results, temp_path("log"));
        sink.persist(&batch()).unwrap();
        let before = std::fs::read_to_string(&results).unwrap();

        // A directory cannot be opened for append.
        let bad = FileSink::new(std::env::temp_dir(), std::env::temp_dir());
        let e = bad.persist(&batch()).unwrap_err();
        assert!(e.to_string().starts_with("writing results"), "e={}", e);
        assert!(bad.audit("x").is_err());

        assert_eq!(std::fs::read_to_string(&results).unwrap(), before);
        let _ = std::fs::remove_file(results);
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let results = temp_path("results");
        let sink = FileSink::new(&results, temp_path("log"));
        assert_eq!(sink.persist(&[]).unwrap(), 0);
        assert!(!results.exists());
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        let b = batch();
        sink.persist(&b).unwrap();
        sink.audit("hello").unwrap();
        assert_eq!(sink.records(), vec![b[0].record_line(), b[1].record_line()]);
        assert!(sink.audits()[0].ends_with(": hello"));
    }
}
