//! Pending mutation lifecycle.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::errors::SyncError;
use super::records::{Record, TEMP_ID_PREFIX};

/// Locally minted id of a provisional record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(String);

impl TempId {
    /// Fresh `tmp-<uuid>` id.
    pub fn generate() -> Self {
        TempId(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    /// As a record id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a mutation is in the speculative apply / commit / reconcile protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationStatus {
    /// Provisional record applied, commit in flight.
    Pending,
    /// Server accepted the mutation. `record_id` is absent when the response
    /// carried no record.
    Confirmed {
        /// Server-assigned id
        record_id: Option<String>,
    },
    /// Commit failed and the provisional record was removed.
    RolledBack {
        /// Failure surfaced to the caller
        error: SyncError,
    },
}

impl MutationStatus {
    /// Pending, not yet settled.
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationStatus::Pending)
    }
}

/// A speculative change awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Slot the mutation holds while in flight.
    pub slot: String,
    /// Id of the provisional record.
    pub temp_id: TempId,
    /// Intended payload.
    pub payload: Value,
    /// Current status.
    pub status: MutationStatus,
    /// Intent time.
    pub created_at: DateTime<Utc>,
}

impl PendingMutation {
    /// New pending mutation with a fresh temporary id.
    pub fn new(slot: impl Into<String>, payload: Value) -> Self {
        Self {
            slot: slot.into(),
            temp_id: TempId::generate(),
            payload,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// The record shown in place of the change until it settles.
    pub fn provisional_record(&self) -> Record {
        Record::provisional(self.temp_id.as_str(), &self.payload)
    }

    /// Mark confirmed.
    pub fn confirm(&mut self, record_id: Option<String>) {
        self.status = MutationStatus::Confirmed { record_id };
    }

    /// Mark rolled back.
    pub fn roll_back(&mut self, error: SyncError) {
        self.status = MutationStatus::RolledBack { error };
    }
}

/// Result of a settled mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationReceipt {
    /// Id the provisional record carried.
    pub temp_id: TempId,
    /// Final status (never `Pending`).
    pub status: MutationStatus,
    /// Server-confirmed record, when the response carried one.
    pub record: Option<Record>,
}
