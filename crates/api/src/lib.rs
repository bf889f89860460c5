//! Courier public API facade (in-process).
//!
//! Frontends depend on [`CourierApi`]. [`InProcApi`] wires the store, parser, dispatch
//! filter and sink together and maps their errors onto [`CourierError`].

#![forbid(unsafe_code)]

mod config;

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use courier_core::{format_timestamp, Order};
use courier_dispatch::{DispatchError, DispatchQuery};
pub use courier_ingest::{CommitPolicy, IngestReport};
use courier_ingest::IngestError;
use courier_sink::{FileSink, ResultSink, SinkError};
use courier_store::OrderStore;
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

pub use config::{CourierConfig, DEFAULT_LOG_PATH, DEFAULT_RESULT_PATH, DEFAULT_SINK_TIMEOUT_MS};

/// API errors. `NotFound` is an expected outcome, not a fault.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum CourierError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("format: {0}")]
    Format(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(String),
    /// The dispatch batch was computed but could not be written to the result target.
    #[error("not_recorded: dispatch batch of {} orders was computed but not recorded: {reason}", .batch.len())]
    NotRecorded { batch: Vec<Order>, reason: String },
    /// The result write did not finish in time and may still land. Retrying can duplicate it.
    #[error("unconfirmed: dispatch batch of {} orders may or may not have been recorded: {reason}", .batch.len())]
    Unconfirmed { batch: Vec<Order>, reason: String },
}

impl CourierError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    /// The computed batch, for errors raised after dispatch selected it.
    pub fn batch(&self) -> Option<&[Order]> {
        match self {
            Self::NotRecorded { batch, .. } | Self::Unconfirmed { batch, .. } => Some(batch),
            _ => None,
        }
    }
}

/// Why a sink call did not complete.
#[derive(Debug)]
enum SinkFailure {
    Failed(String),
    /// Timed out; the blocking write was not cancelled.
    TimedOut(String),
}

impl std::fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(m) | Self::TimedOut(m) => f.write_str(m),
        }
    }
}

impl From<IngestError> for CourierError {
    fn from(e: IngestError) -> Self {
        if e.is_format() {
            Self::Format(e.to_string())
        } else if e.is_io() {
            Self::Io(e.to_string())
        } else {
            Self::Validation(e.to_string())
        }
    }
}

impl From<DispatchError> for CourierError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NotFound { .. } => Self::NotFound(e.to_string()),
            DispatchError::BlankArea | DispatchError::InvertedWindow { .. } => Self::Validation(e.to_string()),
        }
    }
}

pub type CourierResult<T> = Result<T, CourierError>;

#[derive(Debug, Clone, Serialize)]
pub struct LoadResponse {
    pub report: IngestReport,
    /// Audit failures. The load itself succeeded.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMeta {
    pub anchor: NaiveDateTime,
    pub cutoff: NaiveDateTime,
    pub candidates: usize,
    pub recorded: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub batch: Vec<Order>,
    pub meta: DispatchMeta,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub orders: usize,
    pub epoch: u64,
    pub commit_policy: CommitPolicy,
    pub result_path: String,
    pub log_path: String,
    pub sink_timeout_ms: u64,
}

#[async_trait::async_trait]
pub trait CourierApi: Send + Sync {
    /// Ingest a raw batch (the bytes of an uploaded feed).
    async fn load(&self, body: Vec<u8>) -> CourierResult<LoadResponse>;

    /// Ingest a batch already split into lines.
    async fn load_lines(&self, lines: Vec<String>) -> CourierResult<LoadResponse>;

    /// Compute the dispatch batch for `area` within `[start, end]` and record it.
    async fn filter(&self, area: &str, start: NaiveDateTime, end: NaiveDateTime) -> CourierResult<DispatchResponse>;

    async fn stats(&self) -> CourierResult<Stats>;
}

// ----------------- In-process implementation -----------------

pub struct InProcApi {
    store: Arc<OrderStore>,
    sink: Arc<dyn ResultSink>,
    cfg: CourierConfig,
}

impl InProcApi {
    /// File-backed sink at the configured paths and a fresh store.
    pub fn new(cfg: CourierConfig) -> Self {
        let sink = Arc::new(FileSink::new(cfg.result_path.clone(), cfg.log_path.clone()));
        Self::with_parts(Arc::new(OrderStore::new()), sink, cfg)
    }

    pub fn with_parts(store: Arc<OrderStore>, sink: Arc<dyn ResultSink>, cfg: CourierConfig) -> Self {
        Self { store, sink, cfg }
    }

    /// Ingest from a file on disk; open and read failures are `Io`.
    pub async fn load_file(&self, path: &Path) -> CourierResult<LoadResponse> {
        let path = path.to_path_buf();
        self.load_blocking(move |store, policy| {
            let f = std::fs::File::open(&path).map_err(|e| CourierError::Io(format!("opening {}: {}", path.display(), e)))?;
            Ok(courier_ingest::ingest(store, std::io::BufReader::new(f), policy))
        })
        .await
    }

    pub async fn load_reader<R: BufRead + Send + 'static>(&self, reader: R) -> CourierResult<LoadResponse> {
        self.load_blocking(move |store, policy| Ok(courier_ingest::ingest(store, reader, policy))).await
    }

    /// Read and parse on the blocking pool, then audit the outcome.
    async fn load_blocking<F>(&self, f: F) -> CourierResult<LoadResponse>
    where
        F: FnOnce(&OrderStore, CommitPolicy) -> CourierResult<Result<IngestReport, IngestError>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let policy = self.cfg.commit_policy;
        let res = tokio::task::spawn_blocking(move || f(&store, policy))
            .await
            .map_err(|e| CourierError::Io(format!("load task failed: {}", e)))??;
        self.finish_load(res).await
    }

    async fn finish_load(&self, res: Result<IngestReport, IngestError>) -> CourierResult<LoadResponse> {
        match res {
            Ok(report) => {
                let msg = format!("orders loaded: {} accepted", report.accepted);
                let warnings = self.audit(msg).await.into_iter().collect();
                Ok(LoadResponse { report, warnings })
            }
            Err(e) => {
                let err = CourierError::from(e);
                // Rejections are audited too; a failed audit here must not mask the rejection.
                let _ = self.audit(format!("batch rejected: {}", err)).await;
                Err(err)
            }
        }
    }

    /// Run a sink operation on the blocking pool, bounded by the configured timeout.
    async fn with_sink<T, F>(&self, op: &'static str, f: F) -> Result<T, SinkFailure>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ResultSink) -> Result<T, SinkError> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        let task = tokio::task::spawn_blocking(move || f(sink.as_ref()));
        match tokio::time::timeout(self.cfg.sink_timeout, task).await {
            Ok(Ok(Ok(v))) => Ok(v),
            Ok(Ok(Err(e))) => Err(SinkFailure::Failed(e.to_string())),
            Ok(Err(join)) => Err(SinkFailure::Failed(format!("{} task failed: {}", op, join))),
            Err(_) => {
                counter!("sink_timeouts_total", 1u64);
                Err(SinkFailure::TimedOut(format!("{} timed out after {} ms", op, self.cfg.sink_timeout.as_millis())))
            }
        }
    }

    /// Best-effort audit. Returns the failure text so callers can surface it.
    async fn audit(&self, message: String) -> Option<String> {
        match self.with_sink("audit", move |s| s.audit(&message)).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "api: audit failed");
                Some(format!("audit failed: {}", e))
            }
        }
    }
}

#[async_trait::async_trait]
impl CourierApi for InProcApi {
    async fn load(&self, body: Vec<u8>) -> CourierResult<LoadResponse> {
        let t0 = Instant::now();
        info!(bytes = body.len(), "api: load start");
        let out = self.load_reader(std::io::Cursor::new(body)).await;
        info!(ok = out.is_ok(), took_ms = %t0.elapsed().as_millis(), "api: load done");
        out
    }

    async fn load_lines(&self, lines: Vec<String>) -> CourierResult<LoadResponse> {
        let t0 = Instant::now();
        info!(lines = lines.len(), "api: load_lines start");
        let out = self.load_blocking(move |store, policy| Ok(courier_ingest::ingest_lines(store, &lines, policy))).await;
        info!(ok = out.is_ok(), took_ms = %t0.elapsed().as_millis(), "api: load_lines done");
        out
    }

    async fn filter(&self, area: &str, start: NaiveDateTime, end: NaiveDateTime) -> CourierResult<DispatchResponse> {
        let t0 = Instant::now();
        info!(area = %area, start = %format_timestamp(start), end = %format_timestamp(end), "api: filter start");
        let query = DispatchQuery::new(area, start, end);
        let plan = match courier_dispatch::plan(&self.store, &query) {
            Ok(p) => p,
            Err(e @ DispatchError::NotFound { .. }) => {
                let _ = self.audit(format!("no orders found for area {} between {} and {}", area, format_timestamp(start), format_timestamp(end))).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let orders = plan.orders.clone();
        let recorded = match self.with_sink("persist", move |s| s.persist(&orders)).await {
            Ok(n) => n,
            Err(failure) => {
                let batch = plan.orders.iter().map(|o| (**o).clone()).collect();
                return Err(match failure {
                    SinkFailure::Failed(reason) => {
                        warn!(error = %reason, selected = plan.orders.len(), "api: dispatch batch not recorded");
                        let _ = self.audit(format!("dispatch batch for area {} not recorded: {}", area, reason)).await;
                        CourierError::NotRecorded { batch, reason }
                    }
                    SinkFailure::TimedOut(reason) => {
                        warn!(error = %reason, selected = plan.orders.len(), "api: dispatch batch recording unconfirmed");
                        let _ = self.audit(format!("dispatch batch for area {} unconfirmed: {}", area, reason)).await;
                        CourierError::Unconfirmed { batch, reason }
                    }
                });
            }
        };

        let mut warnings = Vec::new();
        let msg = format!(
            "dispatched {} orders for area {} (anchor {}, cutoff {})",
            recorded,
            area,
            format_timestamp(plan.anchor),
            format_timestamp(plan.cutoff)
        );
        warnings.extend(self.audit(msg).await);

        let batch: Vec<Order> = plan.orders.iter().map(|o| (**o).clone()).collect();
        info!(selected = batch.len(), recorded, took_ms = %t0.elapsed().as_millis(), "api: filter ok");
        Ok(DispatchResponse {
            batch,
            meta: DispatchMeta { anchor: plan.anchor, cutoff: plan.cutoff, candidates: plan.candidates, recorded, warnings },
        })
    }

    async fn stats(&self) -> CourierResult<Stats> {
        let snap = self.store.snapshot();
        Ok(Stats {
            orders: snap.orders.len(),
            epoch: snap.epoch,
            commit_policy: self.cfg.commit_policy,
            result_path: self.cfg.result_path.display().to_string(),
            log_path: self.cfg.log_path.display().to_string(),
            sink_timeout_ms: self.cfg.sink_timeout.as_millis() as u64,
        })
    }
}
