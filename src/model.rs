//! Core data model.
//!
//! An operation is a unit of background work. It has a name (which variant
//! executes it), a lifecycle status, free-form extras and a failure log.
//! The serial lock and registered workers are the coordination rows around it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current time, truncated to the precision both backends persist.
///
/// The lock takeover compares a stored `last_update` for equality, so
/// values written and values read back must be identical.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Store-assigned operation id. Monotonically increasing, doubles as FIFO key.
pub type OperationId = i64;

/// A unit of background work tracked through the serial queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,

    /// Selects the variant that executes this operation.
    pub name: String,

    /// Worker currently or most recently owning this operation.
    pub worker_name: Option<String>,

    pub status: Status,

    /// Variant-specific parameters. The queue doesn't interpret these.
    pub extras: serde_json::Value,

    /// Planned number of records to mutate.
    pub expected: i64,

    /// Records actually mutated. Preserved on failure.
    pub affected: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Newline-separated failure trail. Appended, never overwritten.
    pub log: Option<String>,
}

impl Operation {
    /// Time between creation and the most recent lifecycle mark.
    pub fn duration(&self) -> chrono::Duration {
        match (self.started_at, self.ended_at) {
            (_, Some(ended)) => ended - self.created_at,
            (Some(started), None) => started - self.created_at,
            (None, None) => self.updated_at - self.created_at,
        }
    }

    /// Human-readable form of [`Operation::duration`].
    pub fn hr_duration(&self) -> String {
        let millis = self.duration().num_milliseconds().max(0);
        if millis <= 1000 {
            return format!("{:.3} sec.", millis as f64 / 1000.0);
        }

        let total = millis / 1000;
        let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
        match (hours, minutes) {
            (0, 0) => format!("{seconds}s"),
            (0, _) => format!("{minutes}m {seconds}s"),
            _ => format!("{hours}h {minutes}m {seconds}s"),
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Operation id={} {:?} {}>", self.id, self.name, self.extras)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an operation.
///
/// `created -> processing -> {done, failed}`. The lowercase strings are the
/// persisted representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Enqueued, waiting to be claimed.
    Created,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished successfully. Terminal.
    Done,
    /// Finished with an error. Terminal.
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Created,
        Status::Processing,
        Status::Done,
        Status::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Processing => "processing",
            Status::Done => "done",
            Status::Failed => "failed",
        }
    }

    /// Can transition from self to `to`?
    ///
    /// `failed -> failed` is allowed so repeated failures keep appending to
    /// the log without leaving the terminal state.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Created, Processing) | (Processing, Done) | (Processing, Failed) | (Failed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Status::Created),
            "processing" => Ok(Status::Processing),
            "done" => Ok(Status::Done),
            "failed" => Ok(Status::Failed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new operations. The queue's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub(crate) name: String,
    pub(crate) extras: serde_json::Value,
}

impl NewOperation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extras: serde_json::json!({}),
        }
    }

    pub fn extras(mut self, extras: serde_json::Value) -> Self {
        self.extras = extras;
        self
    }

    /// Record who asked for this work. Stored in extras as `requested_by`.
    pub fn requested_by(mut self, user: uuid::Uuid) -> Self {
        if !self.extras.is_object() {
            self.extras = serde_json::json!({});
        }
        if let Some(map) = self.extras.as_object_mut() {
            map.insert(
                "requested_by".to_string(),
                serde_json::Value::String(user.to_string()),
            );
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Coordination rows
// ---------------------------------------------------------------------------

/// Snapshot of the single serial lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLockState {
    /// Non-null means "locked by this worker".
    pub worker_name: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl SerialLockState {
    pub fn is_locked(&self) -> bool {
        self.worker_name.is_some()
    }
}

/// A pre-authorized worker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredWorker {
    pub id: i64,
    pub worker_name: String,
    pub last_restart: DateTime<Utc>,
}
