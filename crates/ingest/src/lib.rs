//! Courier ingest: turns `weight;area;deliveryTime` lines into validated orders.
//!
//! A batch stops at its first bad line. What happens to lines that validated before it
//! depends on the [`CommitPolicy`].

#![forbid(unsafe_code)]

use std::io::BufRead;
use std::str::FromStr;
use std::time::Instant;

use courier_core::{parse_timestamp, Order, OrderFieldError};
use courier_store::OrderStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const FIELD_SEP: char = ';';
const FIELD_COUNT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("batch must not be empty")]
    EmptyBatch,
    #[error("line {line}: expected 3 fields separated by ';', found {found}: {content}")]
    FieldCount { line: usize, found: usize, content: String },
    #[error("line {line}: invalid weight: {content}")]
    Weight { line: usize, content: String },
    #[error("line {line}: invalid area: {content}")]
    Area { line: usize, content: String },
    #[error("line {line}: invalid delivery time: {content}")]
    DeliveryTime { line: usize, content: String },
    #[error("reading batch: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// 1-based line number of the offending line, if the error is tied to one.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::FieldCount { line, .. }
            | Self::Weight { line, .. }
            | Self::Area { line, .. }
            | Self::DeliveryTime { line, .. } => Some(*line),
            Self::EmptyBatch | Self::Io(_) => None,
        }
    }

    pub fn is_format(&self) -> bool { matches!(self, Self::FieldCount { .. }) }
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyBatch | Self::Weight { .. } | Self::Area { .. } | Self::DeliveryTime { .. })
    }
    pub fn is_io(&self) -> bool { matches!(self, Self::Io(_)) }
}

/// When validated lines become visible in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Parse the whole batch, then publish it in one step. A bad line commits nothing.
    #[default]
    Atomic,
    /// Publish each line as soon as it validates. Lines before a bad line stay committed.
    Progressive,
}

impl FromStr for CommitPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(Self::Atomic),
            "progressive" => Ok(Self::Progressive),
            other => Err(format!("unknown commit policy: {} (expect atomic|progressive)", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub epoch: u64,
    pub policy: CommitPolicy,
}

/// Parse one line. `line_no` is 1-based and only used for diagnostics.
pub fn parse_line(line_no: usize, line: &str) -> Result<Order, IngestError> {
    let content = || line.to_string();
    let fields: Vec<&str> = line.split(FIELD_SEP).collect();
    if fields.len() != FIELD_COUNT {
        return Err(IngestError::FieldCount { line: line_no, found: fields.len(), content: content() });
    }
    let weight = match fields[0].trim().parse::<f64>() {
        Ok(w) if w.is_finite() && w > 0.0 => w,
        _ => return Err(IngestError::Weight { line: line_no, content: content() }),
    };
    let area = fields[1];
    if area.trim().is_empty() {
        return Err(IngestError::Area { line: line_no, content: content() });
    }
    let delivery_time = parse_timestamp(fields[2])
        .ok_or_else(|| IngestError::DeliveryTime { line: line_no, content: content() })?;
    Order::new(weight, area, delivery_time).map_err(|e| match e {
        OrderFieldError::NonPositiveWeight(_) => IngestError::Weight { line: line_no, content: content() },
        OrderFieldError::BlankArea => IngestError::Area { line: line_no, content: content() },
    })
}

/// Parse every line without touching a store. Stops at the first bad line.
pub fn parse_batch<R: BufRead>(mut reader: R) -> Result<Vec<Order>, IngestError> {
    ensure_not_empty(&mut reader)?;
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        out.push(parse_line(idx + 1, &line?)?);
    }
    Ok(out)
}

/// Ingest a batch from a reader into `store`.
pub fn ingest<R: BufRead>(store: &OrderStore, mut reader: R, policy: CommitPolicy) -> Result<IngestReport, IngestError> {
    ensure_not_empty(&mut reader)?;
    run(store, reader.lines(), policy)
}

/// Ingest a batch already split into lines. An empty slice is an empty batch.
pub fn ingest_lines<S: AsRef<str>>(store: &OrderStore, lines: &[S], policy: CommitPolicy) -> Result<IngestReport, IngestError> {
    if lines.is_empty() {
        counter!("ingest_rejected_total", 1u64);
        return Err(IngestError::EmptyBatch);
    }
    run(store, lines.iter().map(|l| Ok::<_, std::io::Error>(l.as_ref().to_string())), policy)
}

fn ensure_not_empty<R: BufRead>(reader: &mut R) -> Result<(), IngestError> {
    if reader.fill_buf()?.is_empty() {
        counter!("ingest_rejected_total", 1u64);
        return Err(IngestError::EmptyBatch);
    }
    Ok(())
}

fn run<I>(store: &OrderStore, lines: I, policy: CommitPolicy) -> Result<IngestReport, IngestError>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let t0 = Instant::now();
    let mut pending: Vec<Order> = Vec::new();

    for (idx, line) in lines.enumerate() {
        let parsed = line.map_err(IngestError::from).and_then(|l| parse_line(idx + 1, &l));
        match parsed {
            Ok(o) => {
                counter!("ingest_lines_total", 1u64);
                pending.push(o);
            }
            Err(e) => {
                counter!("ingest_rejected_total", 1u64);
                match policy {
                    CommitPolicy::Atomic => warn!(error = %e, discarded = pending.len(), "ingest: batch rejected"),
                    CommitPolicy::Progressive => {
                        let committed = pending.len();
                        // Lines before the failure stay committed, published together.
                        let epoch = store.extend(pending);
                        warn!(error = %e, committed, epoch, "ingest: batch stopped; earlier lines stay committed");
                    }
                }
                return Err(e);
            }
        }
    }

    let accepted = pending.len();
    let epoch = store.extend(pending);
    histogram!("ingest_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(accepted, epoch, policy = ?policy, took_ms = %t0.elapsed().as_millis(), "ingest: batch ok");
    Ok(IngestReport { accepted, epoch, policy })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_accepts_valid_and_trims() {
        let o = parse_line(1, " 5.0 ; North ;2024-01-01 10:00:00\r").unwrap();
        assert_eq!(o.weight(), 5.0);
        assert_eq!(o.area(), "North");
        assert_eq!(courier_core::format_timestamp(o.delivery_time()), "2024-01-01 10:00:00");
    }

    #[test]
    fn field_count_is_checked_before_field_validity() {
        let two = parse_line(3, "5.0;North").unwrap_err();
        assert!(two.is_format());
        assert_eq!(two.line(), Some(3));
        let four = parse_line(1, "5.0;North;2024-01-01 10:00:00;extra").unwrap_err();
        assert!(matches!(four, IngestError::FieldCount { found: 4, .. }));
        let junk = parse_line(1, "x;;").unwrap_err();
        assert!(junk.is_validation(), "three empty-ish fields is a validation error, not format");
        assert!(parse_line(1, "").unwrap_err().is_format());
    }

    #[test]
    fn weight_boundaries() {
        assert!(matches!(parse_line(1, "0;North;2024-01-01 10:00:00"), Err(IngestError::Weight { .. })));
        assert!(matches!(parse_line(1, "-1;North;2024-01-01 10:00:00"), Err(IngestError::Weight { .. })));
        assert!(matches!(parse_line(1, "abc;North;2024-01-01 10:00:00"), Err(IngestError::Weight { .. })));
        assert!(matches!(parse_line(1, "NaN;North;2024-01-01 10:00:00"), Err(IngestError::Weight { .. })));
        assert!(matches!(parse_line(1, "inf;North;2024-01-01 10:00:00"), Err(IngestError::Weight { .. })));
        assert_eq!(parse_line(1, "0.0001;North;2024-01-01 10:00:00").unwrap().weight(), 0.0001);
    }

    #[test]
    fn checks_run_in_field_order() {
        // bad weight wins over bad area and bad time
        assert!(matches!(parse_line(1, "0; ;nope"), Err(IngestError::Weight { .. })));
        // bad area wins over bad time
        assert!(matches!(parse_line(1, "1;  ;nope"), Err(IngestError::Area { .. })));
        assert!(matches!(parse_line(1, "1;North;nope"), Err(IngestError::DeliveryTime { .. })));
    }

    #[test]
    fn diagnostics_name_line_and_content() {
        let e = parse_line(7, "-1;North;2024-01-01 10:00:00").unwrap_err();
        let msg = e.to_string();
        assert!(e.is_validation());
        assert!(msg.contains("line 7"), "msg={}", msg);
        assert!(msg.contains("-1;North;2024-01-01 10:00:00"), "msg={}", msg);
    }

    #[test]
    fn commit_policy_from_str() {
        assert_eq!("Atomic".parse::<CommitPolicy>().unwrap(), CommitPolicy::Atomic);
        assert_eq!(" progressive ".parse::<CommitPolicy>().unwrap(), CommitPolicy::Progressive);
        assert!("later".parse::<CommitPolicy>().is_err());
        assert_eq!(CommitPolicy::default(), CommitPolicy::Atomic);
    }

    #[test]
    fn parse_batch_rejects_zero_bytes() {
        let e = parse_batch(std::io::Cursor::new(Vec::<u8>::new())).unwrap_err();
        assert!(matches!(e, IngestError::EmptyBatch));
        assert!(e.is_validation());
        assert_eq!(e.to_string(), "batch must not be empty");
    }

    #[test]
    fn parse_batch_numbers_lines_from_one() {
        let input = "1;North;2024-01-01 10:00:00\n2;North;2024-01-01 10:10:00\n2;North\n";
        let e = parse_batch(std::io::Cursor::new(input)).unwrap_err();
        assert_eq!(e.line(), Some(3));
    }
}
