use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

/// A reservation row keyed by `(org_id, agent_id, endpoint, idem_key)`.
/// `request_hash` is the SHA-256 of the canonicalized payload; replays with
/// the same hash return the captured response, replays with a different hash
/// are rejected as conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub org_id: Uuid,
    pub agent_id: String,
    pub endpoint: String,
    pub idem_key: String,
    pub request_hash: String,
    pub status: String,
    pub response_status: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completes_at: DateTime<Utc>,
}
