use std::sync::Arc;

use akashi_models::{ConflictKind, Decision};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::broker::CONFLICTS_CHANNEL;
use crate::services::embedder::cosine_similarity;
use crate::services::validator::{
    ValidationContext, Validator, ValidatorError, ValidatorVerdict,
};

/// Stage-1 gate thresholds. Injected through the constructor so deployments
/// (and tests) can tune them without recompiling.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub topic_floor: f64,
    pub significance_threshold: f64,
    pub decay_half_life_hours: f64,
    pub candidate_window: i64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            topic_floor: 0.70,
            significance_threshold: 0.35,
            decay_half_life_hours: 168.0,
            candidate_window: 200,
        }
    }
}

/// Stage-1 measurements for a candidate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairScore {
    pub topic_similarity: f64,
    pub divergence: f64,
    pub confidence_weight: f64,
    pub temporal_decay: f64,
    pub significance: f64,
    /// True when the pair skipped the significance threshold because an
    /// active LLM must see cross-agent same-topic pairs regardless: opposite
    /// stances embed close together in bi-encoders, so divergence alone
    /// cannot catch them.
    pub direct_to_llm: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Skip,
    Evaluate(PairScore),
}

impl ScorerConfig {
    /// Candidate gate: topic floor, then significance or the stance-blind
    /// bypass.
    pub fn gate(&self, a: &Decision, b: &Decision, validator_active: bool) -> GateOutcome {
        let (Some(topic_a), Some(topic_b)) = (&a.topic_embedding, &b.topic_embedding) else {
            return GateOutcome::Skip;
        };

        let topic_similarity = cosine_similarity(topic_a, topic_b);
        if topic_similarity < self.topic_floor {
            return GateOutcome::Skip;
        }

        let divergence = match (&a.outcome_embedding, &b.outcome_embedding) {
            (Some(outcome_a), Some(outcome_b)) => {
                (1.0 - cosine_similarity(outcome_a, outcome_b)).clamp(0.0, 1.0)
            }
            // No outcome embeddings: textual inequality is the only signal.
            _ => {
                if a.outcome.trim().eq_ignore_ascii_case(b.outcome.trim()) {
                    0.0
                } else {
                    1.0
                }
            }
        };

        let confidence_weight = (a.confidence + b.confidence) / 2.0;
        let hours_apart = (b.valid_from - a.valid_from).num_seconds().abs() as f64 / 3600.0;
        let temporal_decay = 0.5f64.powf(hours_apart / self.decay_half_life_hours);
        let significance = divergence * confidence_weight * temporal_decay;

        let cross_agent = a.agent_id != b.agent_id;
        let direct_to_llm = validator_active && cross_agent;

        if direct_to_llm || significance >= self.significance_threshold {
            GateOutcome::Evaluate(PairScore {
                topic_similarity,
                divergence,
                confidence_weight,
                temporal_decay,
                significance,
                direct_to_llm,
            })
        } else {
            GateOutcome::Skip
        }
    }
}

pub fn conflict_kind(a: &Decision, b: &Decision) -> ConflictKind {
    if a.agent_id == b.agent_id {
        ConflictKind::SameAgent
    } else {
        ConflictKind::CrossAgent
    }
}

/// Stage 2: ask the LLM for a relationship classification.
pub async fn classify_pair(
    validator: &dyn Validator,
    a: &Decision,
    b: &Decision,
    topic_similarity: f64,
) -> Result<ValidatorVerdict, ValidatorError> {
    let ctx = ValidationContext {
        agent_a: a.agent_id.clone(),
        agent_b: b.agent_id.clone(),
        decision_type_a: a.decision_type.clone(),
        decision_type_b: b.decision_type.clone(),
        outcome_a: a.outcome.clone(),
        outcome_b: b.outcome.clone(),
        timestamp_a: a.valid_from,
        timestamp_b: b.valid_from,
        session_a: a.session_id.clone(),
        session_b: b.session_id.clone(),
        reasoning_a: a.reasoning.clone(),
        reasoning_b: b.reasoning.clone(),
        topic_similarity: Some(topic_similarity),
    };
    validator.validate(&ctx).await
}

/// Two-stage decision-pair analyzer. Runs detached after a decision commits;
/// a validator outage means no conflicts are recorded, never bad ones.
pub struct ConflictScorer {
    pool: PgPool,
    validator: Arc<dyn Validator>,
    config: ScorerConfig,
}

impl ConflictScorer {
    pub fn new(pool: PgPool, validator: Arc<dyn Validator>, config: ScorerConfig) -> Self {
        Self {
            pool,
            validator,
            config,
        }
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score a freshly persisted decision against prior decisions in its org.
    pub async fn score_decision(&self, decision_id: Uuid) {
        if !self.validator.is_active() {
            debug!(%decision_id, "no validator configured; skipping conflict scoring");
            return;
        }
        if let Err(e) = self.score_inner(decision_id).await {
            warn!(%decision_id, error = %e, "conflict scoring failed");
        }
    }

    async fn score_inner(&self, decision_id: Uuid) -> Result<(), sqlx::Error> {
        let Some(b) = self.load_decision(decision_id).await? else {
            return Ok(());
        };
        if b.topic_embedding.is_none() {
            debug!(%decision_id, "decision has no topic embedding; skipping scoring");
            return Ok(());
        }

        let candidates: Vec<Decision> = sqlx::query_as(
            r#"
            SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence,
                   reasoning, session_id, topic_embedding, outcome_embedding, valid_from
            FROM decisions
            WHERE org_id = $1 AND id != $2 AND topic_embedding IS NOT NULL
            ORDER BY valid_from DESC
            LIMIT $3
            "#,
        )
        .bind(b.org_id)
        .bind(b.id)
        .bind(self.config.candidate_window)
        .fetch_all(&self.pool)
        .await?;

        for a in candidates {
            let GateOutcome::Evaluate(score) = self.config.gate(&a, &b, true) else {
                continue;
            };

            match classify_pair(self.validator.as_ref(), &a, &b, score.topic_similarity).await {
                Ok(verdict) if verdict.relationship.persists_as_conflict() => {
                    self.persist_conflict(&a, &b, &verdict, &score).await?;
                }
                Ok(verdict) => {
                    debug!(
                        decision_a = %a.id,
                        decision_b = %b.id,
                        relationship = %verdict.relationship,
                        "pair classified as non-conflicting"
                    );
                }
                Err(e) => {
                    // Fail safe: an LLM outage must not poison the conflict
                    // table with guesses.
                    warn!(decision_a = %a.id, decision_b = %b.id, error = %e, "stage-2 classification failed");
                }
            }
        }
        Ok(())
    }

    async fn load_decision(&self, id: Uuid) -> Result<Option<Decision>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence,
                   reasoning, session_id, topic_embedding, outcome_embedding, valid_from
            FROM decisions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Insert the canonical open conflict and NOTIFY in the same transaction
    /// so subscribers never see a conflict that is not yet queryable.
    async fn persist_conflict(
        &self,
        a: &Decision,
        b: &Decision,
        verdict: &ValidatorVerdict,
        score: &PairScore,
    ) -> Result<(), sqlx::Error> {
        let (first, second) = if a.id < b.id { (a, b) } else { (b, a) };
        let kind = conflict_kind(a, b);

        let mut tx = self.pool.begin().await?;
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO decision_conflicts (
                id, org_id, decision_a_id, decision_b_id, conflict_kind,
                scoring_method, relationship, category, severity, explanation,
                confidence_weight, temporal_decay, status, created_at
            )
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'llm_v2', $5, $6, $7, $8, $9, $10, 'open', NOW())
            ON CONFLICT (decision_a_id, decision_b_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(first.org_id)
        .bind(first.id)
        .bind(second.id)
        .bind(kind.to_string())
        .bind(verdict.relationship.to_string())
        .bind(&verdict.category)
        .bind(&verdict.severity)
        .bind(&verdict.explanation)
        .bind(score.confidence_weight)
        .bind(score.temporal_decay)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((conflict_id,)) = inserted {
            let payload = serde_json::json!({
                "org_id": first.org_id,
                "conflict_id": conflict_id,
                "decision_a_id": first.id,
                "decision_b_id": second.id,
                "relationship": verdict.relationship,
                "severity": verdict.severity,
            });
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CONFLICTS_CHANNEL)
                .bind(payload.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::validator::MockValidator;
    use akashi_models::Relationship;
    use chrono::Utc;

    fn decision(agent: &str, outcome: &str, topic: Vec<f32>, outcome_emb: Vec<f32>) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            agent_id: agent.to_string(),
            org_id: Uuid::nil(),
            decision_type: "security".to_string(),
            outcome: outcome.to_string(),
            confidence: 0.9,
            reasoning: None,
            session_id: None,
            topic_embedding: Some(topic),
            outcome_embedding: Some(outcome_emb),
            valid_from: Utc::now(),
        }
    }

    fn config() -> ScorerConfig {
        ScorerConfig {
            topic_floor: 0.70,
            significance_threshold: 0.35,
            decay_half_life_hours: 168.0,
            candidate_window: 200,
        }
    }

    #[test]
    fn unrelated_topics_are_skipped() {
        let a = decision("alice", "use JWT", vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = decision("bob", "use OAuth", vec![0.0, 1.0], vec![0.0, 1.0]);
        assert_eq!(config().gate(&a, &b, true), GateOutcome::Skip);
    }

    #[test]
    fn high_divergence_same_agent_passes_significance() {
        let a = decision("alice", "approve", vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = decision("alice", "deny", vec![1.0, 0.0], vec![0.0, 1.0]);
        match config().gate(&a, &b, true) {
            GateOutcome::Evaluate(score) => {
                assert!(!score.direct_to_llm);
                assert!(score.significance >= 0.35);
            }
            GateOutcome::Skip => panic!("expected evaluation"),
        }
    }

    #[test]
    fn low_divergence_same_agent_is_skipped() {
        // Nearly identical outcome embeddings, same agent: below threshold.
        let a = decision("alice", "approve", vec![1.0, 0.0], vec![1.0, 0.001]);
        let b = decision("alice", "approve it", vec![1.0, 0.0], vec![1.0, 0.0]);
        assert_eq!(config().gate(&a, &b, true), GateOutcome::Skip);
    }

    #[test]
    fn cross_agent_same_topic_bypasses_the_threshold() {
        // Opposite textual stances embed nearly identically; the bypass must
        // hand the pair to the LLM anyway.
        let a = decision("alice", "we should migrate", vec![1.0, 0.0], vec![1.0, 0.001]);
        let b = decision("bob", "we should not migrate", vec![1.0, 0.0], vec![1.0, 0.0]);
        match config().gate(&a, &b, true) {
            GateOutcome::Evaluate(score) => {
                assert!(score.direct_to_llm);
                assert!(score.significance < 0.35);
            }
            GateOutcome::Skip => panic!("expected direct-to-llm evaluation"),
        }
    }

    #[test]
    fn bypass_requires_an_active_validator() {
        let a = decision("alice", "we should migrate", vec![1.0, 0.0], vec![1.0, 0.001]);
        let b = decision("bob", "we should not migrate", vec![1.0, 0.0], vec![1.0, 0.0]);
        assert_eq!(config().gate(&a, &b, false), GateOutcome::Skip);
    }

    #[test]
    fn missing_topic_embeddings_skip() {
        let mut a = decision("alice", "x", vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = decision("bob", "y", vec![1.0, 0.0], vec![0.0, 1.0]);
        a.topic_embedding = None;
        assert_eq!(config().gate(&a, &b, true), GateOutcome::Skip);
    }

    #[test]
    fn kind_tracks_agent_identity() {
        let a = decision("alice", "x", vec![1.0], vec![1.0]);
        let mut b = decision("alice", "y", vec![1.0], vec![1.0]);
        assert_eq!(conflict_kind(&a, &b), ConflictKind::SameAgent);
        b.agent_id = "bob".to_string();
        assert_eq!(conflict_kind(&a, &b), ConflictKind::CrossAgent);
    }

    #[tokio::test]
    async fn classification_carries_pair_context() {
        let a = decision("alice", "approve", vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = decision("bob", "deny", vec![1.0, 0.0], vec![0.0, 1.0]);

        let mut validator = MockValidator::new();
        validator
            .expect_validate()
            .withf(|ctx| {
                ctx.agent_a == "alice"
                    && ctx.agent_b == "bob"
                    && ctx.outcome_a == "approve"
                    && ctx.outcome_b == "deny"
                    && ctx.topic_similarity.is_some()
            })
            .times(1)
            .returning(|_| {
                Ok(ValidatorVerdict {
                    relationship: Relationship::Contradiction,
                    category: "assessment".to_string(),
                    severity: "high".to_string(),
                    explanation: "opposite outcomes".to_string(),
                })
            });

        let verdict = classify_pair(&validator, &a, &b, 1.0).await.unwrap();
        assert_eq!(verdict.relationship, Relationship::Contradiction);
        assert!(verdict.relationship.persists_as_conflict());
    }

    #[tokio::test]
    async fn stage_two_errors_do_not_produce_verdicts() {
        let a = decision("alice", "approve", vec![1.0], vec![1.0]);
        let b = decision("bob", "deny", vec![1.0], vec![1.0]);

        let mut validator = MockValidator::new();
        validator
            .expect_validate()
            .times(1)
            .returning(|_| Err(ValidatorError::Provider("model offline".to_string())));

        assert!(classify_pair(&validator, &a, &b, 1.0).await.is_err());
    }
}
