use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Dimensionality every topic/outcome embedding must have.
pub const EMBEDDING_DIM: usize = 1024;

/// A durable record of a choice. Embeddings are internal scoring inputs and
/// never serialized out through the API.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Decision {
    pub id: Uuid,
    pub run_id: Uuid,
    pub agent_id: String,
    pub org_id: Uuid,
    pub decision_type: String,
    pub outcome: String,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub session_id: Option<String>,
    #[serde(skip_serializing)]
    pub topic_embedding: Option<Vec<f32>>,
    #[serde(skip_serializing)]
    pub outcome_embedding: Option<Vec<f32>>,
    pub valid_from: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DecisionAlternative {
    pub decision_id: Uuid,
    pub position: i32,
    pub outcome: String,
    pub score: Option<f64>,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DecisionEvidence {
    pub decision_id: Uuid,
    pub position: i32,
    pub source: String,
    pub content: Option<serde_json::Value>,
}

/// Wire shape of an alternative on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlternativeInput {
    pub outcome: String,
    pub score: Option<f64>,
    #[serde(default)]
    pub selected: bool,
}

/// Wire shape of an evidence item on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceInput {
    pub source: String,
    pub content: Option<serde_json::Value>,
}
