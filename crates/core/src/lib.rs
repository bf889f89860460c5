//! Courier core types: validated orders and the shared time/area conventions.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

pub type OrderId = Uuid;

/// Canonical rendering for delivery times in records and diagnostics.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Accepted input layouts, tried in order. All are locale independent.
const INPUT_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Width of the dispatch window measured from the anchor time.
pub const DISPATCH_WINDOW_MINUTES: i64 = 30;

pub fn dispatch_window() -> chrono::Duration {
    chrono::Duration::minutes(DISPATCH_WINDOW_MINUTES)
}

/// Field-level rejection raised when constructing an [`Order`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderFieldError {
    #[error("weight must be a positive number, got {0}")]
    NonPositiveWeight(f64),
    #[error("area must not be empty")]
    BlankArea,
}

/// A validated delivery task. Immutable once built; the store hands out `Arc<Order>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    weight: f64,
    area: String,
    delivery_time: NaiveDateTime,
}

impl Order {
    /// Build an order with a freshly generated id.
    pub fn new(weight: f64, area: &str, delivery_time: NaiveDateTime) -> Result<Self, OrderFieldError> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(OrderFieldError::NonPositiveWeight(weight));
        }
        let area = area.trim();
        if area.is_empty() {
            return Err(OrderFieldError::BlankArea);
        }
        Ok(Self { id: Uuid::new_v4(), weight, area: area.to_string(), delivery_time })
    }

    pub fn id(&self) -> OrderId { self.id }
    pub fn weight(&self) -> f64 { self.weight }
    pub fn area(&self) -> &str { &self.area }
    pub fn delivery_time(&self) -> NaiveDateTime { self.delivery_time }

    pub fn in_area(&self, area: &str) -> bool { area_eq(&self.area, area) }

    /// Inclusive on both ends.
    pub fn due_within(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.delivery_time >= start && self.delivery_time <= end
    }

    /// Durable record form: `id;weight;area;deliveryTime`.
    pub fn record_line(&self) -> String {
        format!("{};{};{};{}", self.id, self.weight, self.area, format_timestamp(self.delivery_time))
    }
}

/// Immutable view of the store published at `epoch`.
#[derive(Debug, Clone, Default)]
pub struct OrderSnapshot {
    pub epoch: u64,
    pub orders: Vec<Arc<Order>>,
}

/// Case-insensitive area comparison using Unicode lowercase folding (no locale tables).
pub fn area_eq(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();
    if a.len() == b.len() && a.eq_ignore_ascii_case(b) {
        return true;
    }
    a.chars().flat_map(char::to_lowercase).eq(b.chars().flat_map(char::to_lowercase))
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime { parse_timestamp(s).unwrap() }

    #[test]
    fn order_rejects_non_positive_and_non_finite_weight() {
        let t = ts("2024-01-01 10:00:00");
        assert_eq!(Order::new(0.0, "North", t).unwrap_err(), OrderFieldError::NonPositiveWeight(0.0));
        assert!(Order::new(-1.0, "North", t).is_err());
        assert!(Order::new(f64::NAN, "North", t).is_err());
        assert!(Order::new(f64::INFINITY, "North", t).is_err());
        assert!(Order::new(0.0001, "North", t).is_ok());
    }

    #[test]
    fn order_rejects_blank_area_and_trims() {
        let t = ts("2024-01-01 10:00:00");
        assert_eq!(Order::new(1.0, "   ", t).unwrap_err(), OrderFieldError::BlankArea);
        let o = Order::new(1.0, "  North ", t).unwrap();
        assert_eq!(o.area(), "North");
    }

    #[test]
    fn ids_are_unique() {
        let t = ts("2024-01-01 10:00:00");
        let a = Order::new(1.0, "North", t).unwrap();
        let b = Order::new(1.0, "North", t).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn area_eq_folds_case() {
        assert!(area_eq("North", "north"));
        assert!(area_eq("NORTH", " north "));
        assert!(area_eq("Südviertel", "SÜDVIERTEL"));
        assert!(!area_eq("North", "South"));
        assert!(!area_eq("North", "Northeast"));
    }

    #[test]
    fn timestamp_formats() {
        let a = ts("2024-01-01 10:00:00");
        assert_eq!(parse_timestamp("2024-01-01T10:00:00"), Some(a));
        assert_eq!(parse_timestamp("2024-01-01 10:00"), Some(a));
        assert_eq!(parse_timestamp(" 2024-01-01 10:00:00\r"), Some(a));
        assert_eq!(parse_timestamp("01/01/2024 10:00"), None);
        assert_eq!(parse_timestamp("2024-02-30 10:00:00"), None);
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(format_timestamp(a), "2024-01-01 10:00:00");
    }

    #[test]
    fn record_line_layout() {
        let o = Order::new(5.0, "North", ts("2024-01-01 10:00:00")).unwrap();
        let line = o.record_line();
        let parts: Vec<&str> = line.split(';').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], o.id().to_string());
        assert_eq!(parts[1], "5");
        assert_eq!(parts[2], "North");
        assert_eq!(parts[3], "2024-01-01 10:00:00");
        let small = Order::new(0.0001, "North", ts("2024-01-01 10:00:00")).unwrap();
        assert!(small.record_line().contains(";0.0001;"));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let o = Order::new(1.0, "North", ts("2024-01-01 10:00:00")).unwrap();
        assert!(o.due_within(ts("2024-01-01 10:00:00"), ts("2024-01-01 10:00:00")));
        assert!(!o.due_within(ts("2024-01-01 10:00:01"), ts("2024-01-01 11:00:00")));
        assert_eq!(dispatch_window(), chrono::Duration::minutes(30));
    }
}
