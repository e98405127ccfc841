use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only record of a mutating request. Written inside the mutation's
/// transaction where the write path supports it; the append-events path uses
/// a bounded best-effort write instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationAudit {
    pub request_id: Option<String>,
    pub org_id: Uuid,
    pub actor_agent_id: String,
    pub actor_role: String,
    pub method: String,
    pub endpoint: String,
    pub operation: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}
