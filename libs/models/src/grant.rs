use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Resource type for delegated read access over an agent's traces.
pub const RESOURCE_AGENT_TRACES: &str = "agent_traces";

/// Permission granted by an [`AccessGrant`].
pub const PERMISSION_READ: &str = "read";

/// An explicit read capability from one agent to another. Expired grants are
/// inert; `resource_id` names the target agent whose traces may be read.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessGrant {
    pub id: Uuid,
    pub org_id: Uuid,
    pub grantor_id: Uuid,
    pub grantee_id: Uuid,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub permission: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
