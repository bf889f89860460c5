//! Courier dispatch: pick the orders for one area and window, then keep only those due
//! within the dispatch window of the earliest one.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use courier_core::{dispatch_window, format_timestamp, Order};
use courier_store::OrderStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("area must not be empty")]
    BlankArea,
    #[error("start time {start} must not be after end time {end}")]
    InvertedWindow { start: String, end: String },
    #[error("no orders for area {area} between {start} and {end}")]
    NotFound { area: String, start: String, end: String },
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchQuery {
    pub area: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DispatchQuery {
    pub fn new(area: impl Into<String>, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { area: area.into(), start, end }
    }

    /// Reject blank areas and inverted windows. Runs before any store access.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.area.trim().is_empty() {
            return Err(DispatchError::BlankArea);
        }
        if self.start > self.end {
            return Err(DispatchError::InvertedWindow {
                start: format_timestamp(self.start),
                end: format_timestamp(self.end),
            });
        }
        Ok(())
    }
}

/// Selected dispatch batch plus how its window was derived.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub orders: Vec<Arc<Order>>,
    /// Earliest delivery time among the candidates.
    pub anchor: NaiveDateTime,
    /// `anchor` plus the dispatch window; inclusive.
    pub cutoff: NaiveDateTime,
    /// Orders matching area and window before narrowing.
    pub candidates: usize,
}

/// Narrow candidates to the dispatch window. `None` when there are no candidates.
///
/// Every order sharing the anchor time is kept. Input order is preserved.
pub fn narrow(candidates: Vec<Arc<Order>>) -> Option<DispatchPlan> {
    let anchor = candidates.iter().map(|o| o.delivery_time()).min()?;
    let cutoff = anchor + dispatch_window();
    let total = candidates.len();
    let orders: Vec<Arc<Order>> = candidates.into_iter().filter(|o| o.delivery_time() <= cutoff).collect();
    Some(DispatchPlan { orders, anchor, cutoff, candidates: total })
}

/// Run the full filter against `store`.
pub fn plan(store: &OrderStore, query: &DispatchQuery) -> Result<DispatchPlan, DispatchError> {
    query.validate()?;
    let t0 = Instant::now();
    let candidates = store.query(&query.area, query.start, query.end);
    debug!(area = %query.area, candidates = candidates.len(), "dispatch: candidates selected");
    let res = narrow(candidates).ok_or_else(|| DispatchError::NotFound {
        area: query.area.clone(),
        start: format_timestamp(query.start),
        end: format_timestamp(query.end),
    });
    histogram!("dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(p) => {
            counter!("dispatch_batches_total", 1u64);
            info!(area = %query.area, anchor = %format_timestamp(p.anchor), cutoff = %format_timestamp(p.cutoff), candidates = p.candidates, selected = p.orders.len(), "dispatch: plan ok");
        }
        Err(_) => {
            counter!("dispatch_not_found_total", 1u64);
            info!(area = %query.area, "dispatch: no eligible orders");
        }
    }
    res
}
