use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Classified relationship between two decisions of the same organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Relationship {
    Contradiction,
    Supersession,
    Complementary,
    Refinement,
    Unrelated,
}

impl Relationship {
    /// Only contradictions and supersessions are ever persisted as open
    /// conflicts; the other relationships are informational.
    pub fn persists_as_conflict(self) -> bool {
        matches!(self, Relationship::Contradiction | Relationship::Supersession)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictKind {
    SameAgent,
    CrossAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Dismissed,
}

/// A persisted conflict row. The pair is canonical: `decision_a_id` is always
/// the smaller UUID so mirror rows cannot exist.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DecisionConflict {
    pub id: Uuid,
    pub org_id: Uuid,
    pub decision_a_id: Uuid,
    pub decision_b_id: Uuid,
    pub conflict_kind: String,
    pub scoring_method: String,
    pub relationship: String,
    pub category: String,
    pub severity: String,
    pub explanation: String,
    pub confidence_weight: f64,
    pub temporal_decay: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contradiction_and_supersession_persist() {
        assert!(Relationship::Contradiction.persists_as_conflict());
        assert!(Relationship::Supersession.persists_as_conflict());
        assert!(!Relationship::Complementary.persists_as_conflict());
        assert!(!Relationship::Refinement.persists_as_conflict());
        assert!(!Relationship::Unrelated.persists_as_conflict());
    }

    #[test]
    fn relationship_parses_snake_case() {
        assert_eq!(
            "contradiction".parse::<Relationship>().unwrap(),
            Relationship::Contradiction
        );
        assert_eq!(ConflictKind::CrossAgent.to_string(), "cross_agent");
    }
}
