//! Outbox message types.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Selects the delivery handler for a message.
///
/// Persisted as a small integer. Values this build does not know read back as
/// [`OutboxKind::Undefined`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    #[default]
    Undefined,
    Book,
    Author,
}

impl OutboxKind {
    pub const ALL: [OutboxKind; 3] = [OutboxKind::Undefined, OutboxKind::Book, OutboxKind::Author];

    pub fn as_i32(self) -> i32 {
        match self {
            OutboxKind::Undefined => 0,
            OutboxKind::Book => 1,
            OutboxKind::Author => 2,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => OutboxKind::Book,
            2 => OutboxKind::Author,
            _ => OutboxKind::Undefined,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutboxKind::Undefined => "undefined",
            OutboxKind::Book => "book",
            OutboxKind::Author => "author",
        }
    }
}

impl std::fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row status. `Success` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Created,
    InProgress,
    Success,
}

impl OutboxStatus {
    /// Name of the value in the `outbox_status` database enum.
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Created => "CREATED",
            OutboxStatus::InProgress => "IN_PROGRESS",
            OutboxStatus::Success => "SUCCESS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(OutboxStatus::Created),
            "IN_PROGRESS" => Some(OutboxStatus::InProgress),
            "SUCCESS" => Some(OutboxStatus::Success),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed message, as handed to a delivery handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub idempotency_key: String,
    pub kind: OutboxKind,
    pub payload: Vec<u8>,
}

/// A full outbox row (in-memory backend storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub idempotency_key: String,
    pub kind: OutboxKind,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// A fresh `CREATED` row.
    pub fn created(
        idempotency_key: impl Into<String>,
        kind: OutboxKind,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            kind,
            payload,
            status: OutboxStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// `CREATED`, or `IN_PROGRESS` whose lease is strictly older than `lease_ttl`.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        match self.status {
            OutboxStatus::Created => true,
            OutboxStatus::InProgress => {
                let ttl = TimeDelta::from_std(lease_ttl).unwrap_or(TimeDelta::MAX);
                now.signed_duration_since(self.updated_at) > ttl
            }
            OutboxStatus::Success => false,
        }
    }

    pub fn to_message(&self) -> OutboxMessage {
        OutboxMessage {
            idempotency_key: self.idempotency_key.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
        }
    }
}
