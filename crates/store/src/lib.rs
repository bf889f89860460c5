//! Courier store: append-only order log published as lock-free snapshots.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::NaiveDateTime;
use courier_core::{Order, OrderSnapshot};
use metrics::{counter, gauge};
use tokio::sync::watch;
use tracing::debug;

/// Writer-side state. Accumulates orders and freezes them into snapshots.
pub struct OrderLog {
    epoch: u64,
    orders: Vec<Arc<Order>>,
}

impl OrderLog {
    pub fn new() -> Self { Self { epoch: 0, orders: Vec::new() } }

    /// Append a batch and advance the epoch once for the whole batch.
    pub fn append(&mut self, batch: Vec<Order>) {
        self.orders.reserve(batch.len());
        self.orders.extend(batch.into_iter().map(Arc::new));
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<OrderSnapshot> {
        Arc::new(OrderSnapshot { epoch: self.epoch, orders: self.orders.clone() })
    }
}

impl Default for OrderLog {
    fn default() -> Self { Self::new() }
}

/// Process-wide order store.
///
/// Writers serialize on an internal mutex and publish by swapping the snapshot pointer,
/// so readers never block and never observe a half-applied batch.
pub struct OrderStore {
    log: Mutex<OrderLog>,
    snap: ArcSwap<OrderSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl OrderStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            log: Mutex::new(OrderLog::new()),
            snap: ArcSwap::from_pointee(OrderSnapshot::default()),
            epoch_tx,
        }
    }

    pub fn add(&self, order: Order) -> u64 {
        self.extend(vec![order])
    }

    /// Publish all orders together. Returns the epoch of the new snapshot.
    pub fn extend(&self, batch: Vec<Order>) -> u64 {
        if batch.is_empty() {
            return self.snapshot().epoch;
        }
        let n = batch.len();
        // Poisoning cannot leave the log half-written: append is the only mutation.
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.append(batch);
        let next = log.freeze();
        let epoch = next.epoch;
        let total = next.orders.len();
        self.snap.store(next);
        drop(log);
        self.epoch_tx.send_replace(epoch);
        counter!("store_orders_added_total", n as u64);
        gauge!("store_orders", total as f64);
        debug!(added = n, total, epoch, "store: snapshot published");
        epoch
    }

    pub fn snapshot(&self) -> Arc<OrderSnapshot> { self.snap.load_full() }

    pub fn len(&self) -> usize { self.snap.load().orders.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Orders in `area` (case-insensitive) due within `[start, end]`, in insertion order.
    pub fn query(&self, area: &str, start: NaiveDateTime, end: NaiveDateTime) -> Vec<Arc<Order>> {
        let snap = self.snap.load();
        snap.orders
            .iter()
            .filter(|o| o.in_area(area) && o.due_within(start, end))
            .cloned()
            .collect()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

impl Default for OrderStore {
    fn default() -> Self { Self::new() }
}
