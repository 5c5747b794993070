//! Transactional outbox.
//!
//! ## Design
//!
//! - A message is enqueued in the same transaction as the business write that
//!   produced it, so both become durable together or not at all
//! - Delivery is at-least-once; receivers must be idempotent
//! - Workers claim batches under a lease; an expired lease makes a row due again
//! - Successfully delivered rows become `SUCCESS` and are never claimed again
//!
//! ## Components
//!
//! - `OutboxStore`: enqueue / claim / complete (in-memory or Postgres)
//! - `KindRegistry`: delivery handler per `OutboxKind`
//! - `OutboxDispatcher`: worker tasks running claim-deliver-complete cycles
//! - `OutcomeSink`: observers of per-message delivery outcomes

pub mod dispatcher;
pub mod in_memory;
pub mod message;
pub mod outcome;
pub mod postgres;
pub mod registry;
pub mod store;

pub use dispatcher::{
    CycleReport, DispatcherConfig, DispatcherHandle, DispatcherSwitch, OutboxDispatcher,
};
pub use in_memory::InMemoryOutboxStore;
pub use message::{OutboxKind, OutboxMessage, OutboxRecord, OutboxStatus};
pub use outcome::{
    ChannelSink, DeliveryOutcome, DeliveryStats, DeliveryStatus, Fanout, KindStats, LogSink,
    OutcomeSink,
};
pub use postgres::PostgresOutboxStore;
pub use registry::{DeliveryError, HandlerRegistry, KindHandler, KindRegistry};
pub use store::{OutboxError, OutboxStore, StatusCounts};
