//! Delivery outcome events and the sinks that observe them.
//!
//! The dispatcher reports what happened to every processed message as an
//! immutable [`DeliveryOutcome`]. It never keeps counters of its own; anything
//! metrics-like is an [`OutcomeSink`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::OutboxKind;

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The handler ran and returned an error.
    Failed(String),
    /// No handler is registered for the message kind.
    UnknownKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub idempotency_key: String,
    pub kind: OutboxKind,
    pub status: DeliveryStatus,
    pub latency: Duration,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered)
    }
}

/// Observer of delivery outcomes. Must not block.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: &DeliveryOutcome);
}

impl<S: OutcomeSink + ?Sized> OutcomeSink for Arc<S> {
    fn record(&self, outcome: &DeliveryOutcome) {
        (**self).record(outcome)
    }
}

/// Logs every outcome through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn record(&self, outcome: &DeliveryOutcome) {
        let latency_ms = outcome.latency.as_millis() as u64;
        match &outcome.status {
            DeliveryStatus::Delivered => debug!(
                idempotency_key = %outcome.idempotency_key,
                kind = %outcome.kind,
                latency_ms,
                "outbox message delivered"
            ),
            DeliveryStatus::Failed(reason) => warn!(
                idempotency_key = %outcome.idempotency_key,
                kind = %outcome.kind,
                latency_ms,
                error = %reason,
                "outbox delivery failed"
            ),
            DeliveryStatus::UnknownKind(reason) => warn!(
                idempotency_key = %outcome.idempotency_key,
                kind = %outcome.kind,
                error = %reason,
                "outbox message has no handler"
            ),
        }
    }
}

/// Forwards outcomes into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeliveryOutcome>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeliveryOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutcomeSink for ChannelSink {
    fn record(&self, outcome: &DeliveryOutcome) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(outcome.clone());
    }
}

/// Per-kind delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub delivered: u64,
    pub failed: u64,
    pub unknown_kind: u64,
    pub total_latency_ms: u64,
}

impl KindStats {
    pub fn attempts(&self) -> u64 {
        self.delivered + self.failed + self.unknown_kind
    }
}

/// Aggregates outcomes into per-kind counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    by_kind: Mutex<HashMap<OutboxKind, KindStats>>,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: OutboxKind) -> KindStats {
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Counters keyed by kind name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, KindStats> {
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(kind, stats)| (kind.as_str(), *stats))
            .collect()
    }
}

impl OutcomeSink for DeliveryStats {
    fn record(&self, outcome: &DeliveryOutcome) {
        let mut by_kind = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = by_kind.entry(outcome.kind).or_default();
        match outcome.status {
            DeliveryStatus::Delivered => stats.delivered += 1,
            DeliveryStatus::Failed(_) => stats.failed += 1,
            DeliveryStatus::UnknownKind(_) => stats.unknown_kind += 1,
        }
        stats.total_latency_ms += outcome.latency.as_millis() as u64;
    }
}

/// Sends every outcome to several sinks, in order.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl OutcomeSink for Fanout {
    fn record(&self, outcome: &DeliveryOutcome) {
        for sink in &self.sinks {
            sink.record(outcome);
        }
    }
}
