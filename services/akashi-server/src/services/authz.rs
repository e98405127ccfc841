use std::collections::HashSet;

use akashi_common::AppError;
use akashi_models::{Role, PERMISSION_READ, RESOURCE_AGENT_TRACES};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::services::jwt::Claims;

/// The set of agent ids a caller may read. Admins get the wildcard; everyone
/// else gets their own id (writers only) plus whatever non-expired grants
/// name them as grantee.
#[derive(Debug, Clone)]
pub enum GrantedSet {
    All,
    Only(HashSet<String>),
}

impl GrantedSet {
    pub fn empty() -> Self {
        GrantedSet::Only(HashSet::new())
    }

    pub fn allows(&self, agent_id: &str) -> bool {
        match self {
            GrantedSet::All => true,
            GrantedSet::Only(set) => set.contains(agent_id),
        }
    }

    /// Conflicts require access to both sides of the pair.
    pub fn allows_pair(&self, agent_a: &str, agent_b: &str) -> bool {
        self.allows(agent_a) && self.allows(agent_b)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GrantedSet::All => false,
            GrantedSet::Only(set) => set.is_empty(),
        }
    }

    /// The ids to bind into `agent_id = ANY($n)` filters; `None` means no
    /// filter (wildcard).
    pub fn as_filter(&self) -> Option<Vec<String>> {
        match self {
            GrantedSet::All => None,
            GrantedSet::Only(set) => Some(set.iter().cloned().collect()),
        }
    }
}

/// Load the caller's granted set in a single query. A malformed subject UUID
/// is a denial, never an internal error.
pub async fn load_granted_set(pool: &PgPool, claims: &Claims) -> Result<GrantedSet, AppError> {
    if claims.role.is_admin() {
        return Ok(GrantedSet::All);
    }

    let Some(subject) = claims.subject_uuid() else {
        warn!(sub = %claims.sub, "malformed subject uuid in claims; denying all access");
        return Ok(GrantedSet::empty());
    };

    let mut set = HashSet::new();
    if claims.role.can_write() {
        set.insert(claims.agent_id.clone());
    }

    let rows: Vec<(Option<String>,)> = sqlx::query_as(
        r#"
        SELECT resource_id
        FROM access_grants
        WHERE org_id = $1
          AND grantee_id = $2
          AND resource_type = $3
          AND permission = $4
          AND (expires_at IS NULL OR expires_at > NOW())
        "#,
    )
    .bind(claims.org_id)
    .bind(subject)
    .bind(RESOURCE_AGENT_TRACES)
    .bind(PERMISSION_READ)
    .fetch_all(pool)
    .await?;

    for (resource_id,) in rows {
        match resource_id {
            // A grant without a target agent covers the whole organization.
            None => return Ok(GrantedSet::All),
            Some(agent_id) => {
                set.insert(agent_id);
            }
        }
    }

    Ok(GrantedSet::Only(set))
}

/// May the caller read `agent_id`'s data at all?
pub async fn can_read_agent(
    pool: &PgPool,
    claims: &Claims,
    agent_id: &str,
) -> Result<bool, AppError> {
    if claims.role.is_admin() {
        return Ok(true);
    }
    if claims.role >= Role::Agent && claims.agent_id == agent_id {
        return Ok(true);
    }
    let set = load_granted_set(pool, claims).await?;
    Ok(set.allows(agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_admits_everything() {
        let set = GrantedSet::All;
        assert!(set.allows("anyone"));
        assert!(set.allows_pair("a", "b"));
        assert!(set.as_filter().is_none());
        assert!(!set.is_empty());
    }

    #[test]
    fn only_set_admits_members() {
        let set = GrantedSet::Only(["alice".to_string(), "bob".to_string()].into());
        assert!(set.allows("alice"));
        assert!(!set.allows("carol"));
        assert!(set.allows_pair("alice", "bob"));
        assert!(!set.allows_pair("alice", "carol"));
    }

    #[test]
    fn empty_set_denies_everything() {
        let set = GrantedSet::empty();
        assert!(set.is_empty());
        assert!(!set.allows("alice"));
        assert_eq!(set.as_filter().map(|f| f.len()), Some(0));
    }
}
