//! Core types for qualer-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// One decoded result row: field name to scalar value, in upstream key order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Integer key identifying a technique, service group, certification, ...
///
/// Read from a list endpoint or a table column and only ever used as a lookup parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(pub i64);

impl ReferenceId {
    /// Create a new ReferenceId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ReferenceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<ReferenceId> for i64 {
    fn from(id: ReferenceId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for ReferenceId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReferenceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

// Implement sqlx Type and Decode so ids can be read straight out of reference tables
impl sqlx::Type<sqlx::Sqlite> for ReferenceId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ReferenceId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// The (A, B) reference id pair one fetch task looks up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskPair {
    /// Outer dimension (e.g. service group)
    pub a: ReferenceId,
    /// Inner dimension (e.g. technique)
    pub b: ReferenceId,
}

impl TaskPair {
    /// Create a new pair
    pub fn new(a: ReferenceId, b: ReferenceId) -> Self {
        Self { a, b }
    }
}

impl std::fmt::Display for TaskPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.a, self.b)
    }
}

/// Lifecycle of one fetch task
///
/// `Pending → Running → {Succeeded, Failed}`. `Skipped` is reachable only from `Pending`,
/// for tasks never dispatched after a fail-fast halt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Not yet dispatched
    Pending,
    /// Fetching (including retry back-off) or writing
    Running,
    /// Rows fetched and handed to the sink
    Succeeded,
    /// Terminal error
    Failed,
    /// Never dispatched because the batch halted
    Skipped,
}

impl TaskState {
    /// Whether `self → next` is a legal forward transition
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Skipped)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Succeeded => 2,
            TaskState::Failed => 3,
            TaskState::Skipped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            3 => TaskState::Failed,
            4 => TaskState::Skipped,
            _ => TaskState::Pending,
        }
    }
}

/// A pair whose task ended FAILED, kept for a follow-up pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPair {
    /// The pair that failed
    pub pair: TaskPair,
    /// Classification of the terminal error
    pub kind: ErrorKind,
    /// Rendered error message
    pub message: String,
}

/// Outcome of one fan-out batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    /// Job label (e.g. "uncertainty_budgets")
    pub job: String,
    /// Number of pairs in the batch
    pub total: usize,
    /// Tasks that ended SUCCEEDED
    pub succeeded: usize,
    /// Tasks that ended FAILED
    pub failed: Vec<FailedPair>,
    /// Tasks never dispatched (fail-fast halt)
    pub skipped: usize,
    /// Rows handed to the sink
    pub rows_written: u64,
    /// Highest number of simultaneously RUNNING tasks observed
    pub peak_running: usize,
    /// When the batch started
    pub started_at: DateTime<Utc>,
    /// When the batch finished
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    /// True when every task succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0 && self.succeeded == self.total
    }
}

/// Progress events broadcast while a run is in flight
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Reference lists fetched
    ReferencesLoaded {
        /// Rows in the list endpoint result
        service_groups: usize,
        /// Rows in the flat endpoint result
        techniques: usize,
    },
    /// A fan-out batch is about to dispatch
    BatchStarted {
        /// Job label
        job: String,
        /// Number of pairs
        total: usize,
    },
    /// One task succeeded and its rows were written (stream) or buffered (buffer)
    TaskCompleted {
        /// The pair
        pair: TaskPair,
        /// Rows the task produced
        rows: usize,
        /// Tasks finished so far
        completed: usize,
        /// Tasks in the batch
        total: usize,
    },
    /// One task ended FAILED
    TaskFailed {
        /// The pair
        pair: TaskPair,
        /// Error classification
        kind: ErrorKind,
        /// Rendered error
        error: String,
        /// Tasks finished so far
        completed: usize,
        /// Tasks in the batch
        total: usize,
    },
    /// A fan-out batch finished
    BatchFinished {
        /// Job label
        job: String,
        /// Successful tasks
        succeeded: usize,
        /// Failed tasks
        failed: usize,
        /// Rows written
        rows_written: u64,
    },
}

/// Append enrichment columns to every row
///
/// Existing keys with the same name are overwritten, so the persisted value is always the
/// id the row was fetched with.
pub fn enrich_rows(rows: &mut [Row], columns: &[(&str, ReferenceId)]) {
    for row in rows.iter_mut() {
        for (name, id) in columns {
            row.insert((*name).to_string(), serde_json::Value::from(id.get()));
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_state_forward_only() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Pending));
        assert!(!TaskState::Running.can_transition_to(TaskState::Skipped));
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_task_state_u8_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Skipped,
        ] {
            assert_eq!(TaskState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn test_enrich_appends_keys_after_upstream_fields() {
        let mut rows: Vec<Row> = vec![
            json!({"BudgetId": 1, "Value": "X"})
                .as_object()
                .cloned()
                .unwrap(),
        ];

        enrich_rows(
            &mut rows,
            &[
                ("ServiceGroupId", ReferenceId(1)),
                ("TechniqueId", ReferenceId(10)),
            ],
        );

        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["BudgetId", "Value", "ServiceGroupId", "TechniqueId"]);
        assert_eq!(rows[0]["TechniqueId"], json!(10));
    }

    #[test]
    fn test_reference_id_parse_and_display() {
        let id: ReferenceId = " 855 ".parse().unwrap();
        assert_eq!(id, 855);
        assert_eq!(id.to_string(), "855");
        assert_eq!(
            TaskPair::new(ReferenceId(14319), id).to_string(),
            "(14319, 855)"
        );
    }
}
