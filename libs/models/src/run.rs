use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub agent_id: String,
    pub org_id: Uuid,
    pub status: String,
    pub trace_id: Option<String>,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An append-only entry on a run. `sequence` is contiguous and monotonic
/// within a run; rows are never rewritten once flushed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

/// Wire shape of an event before it is assigned an id and sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRunEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}
