use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Agent roles, totally ordered by privilege. Declaration order is rank order,
/// so the derived `Ord` gives `Reader < Agent < Admin < OrgOwner < PlatformAdmin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Reader,
    Agent,
    Admin,
    OrgOwner,
    PlatformAdmin,
}

impl Role {
    /// Admin-or-above: exempt from rate limits, full read access, agent management.
    pub fn is_admin(self) -> bool {
        self >= Role::Admin
    }

    /// May produce runs and decisions of its own.
    pub fn can_write(self) -> bool {
        self >= Role::Agent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub agent_id: String,
    pub role: String,
    #[serde(skip_serializing)]
    pub api_key_hash: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Parsed role; unknown strings degrade to the least-privileged role.
    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::Reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_follows_rank() {
        assert!(Role::Reader < Role::Agent);
        assert!(Role::Agent < Role::Admin);
        assert!(Role::Admin < Role::OrgOwner);
        assert!(Role::OrgOwner < Role::PlatformAdmin);
    }

    #[test]
    fn role_round_trips_through_snake_case() {
        assert_eq!("org_owner".parse::<Role>().unwrap(), Role::OrgOwner);
        assert_eq!(Role::PlatformAdmin.to_string(), "platform_admin");
    }

    #[test]
    fn admin_threshold() {
        assert!(!Role::Agent.is_admin());
        assert!(Role::Admin.is_admin());
        assert!(Role::PlatformAdmin.is_admin());
    }
}
