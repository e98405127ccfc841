use std::collections::HashMap;
use std::sync::Arc;

use akashi_common::{validation, AppError};
use akashi_models::{AlternativeInput, Decision, EvidenceInput, MutationAudit, Run};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

use crate::services::audit;
use crate::services::authz;
use crate::services::broker::DECISIONS_CHANNEL;
use crate::services::embedder::{cosine_similarity, Embedder};
use crate::services::jwt::Claims;
use crate::services::scorer::ConflictScorer;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DecisionInput {
    #[validate(length(min = 1, max = 255))]
    pub decision_type: String,
    #[validate(length(min = 1))]
    pub outcome: String,
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub topic: Option<String>,
    #[serde(default)]
    pub alternatives: Vec<AlternativeInput>,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TraceInput {
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub agent_id: String,
    pub run_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub session_id: Option<String>,
    #[validate(nested)]
    pub decision: DecisionInput,
}

#[derive(Debug, Serialize)]
pub struct TraceOutput {
    pub run_id: Uuid,
    pub decision_id: Uuid,
    pub event_count: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 1024))]
    pub query: String,
    /// Semantic re-ranking is on by default when an embedder is configured.
    #[serde(default = "default_true")]
    pub semantic: bool,
    pub limit: Option<i64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub decision: Decision,
    pub score: f64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckRequest {
    pub agent_id: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub decision_type: String,
    #[validate(length(min = 1))]
    pub outcome: String,
    pub topic: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CheckMatch {
    pub decision: Decision,
    pub topic_similarity: Option<f64>,
    pub outcome_matches: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckOutput {
    pub matches: Vec<CheckMatch>,
    pub would_conflict: bool,
}

const DECISION_COLUMNS: &str = "id, run_id, agent_id, org_id, decision_type, outcome, confidence, \
     reasoning, session_id, topic_embedding, outcome_embedding, valid_from";

/// Orchestrates ingestion and the read paths that need embeddings. Plain
/// filtered reads live in the handlers.
pub struct DecisionService {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
    scorer: Arc<ConflictScorer>,
}

impl DecisionService {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>, scorer: Arc<ConflictScorer>) -> Self {
        Self {
            pool,
            embedder,
            scorer,
        }
    }

    /// Atomically create or extend a run, persist the decision with its
    /// alternatives and evidence, record the audit row, and NOTIFY, all in
    /// one transaction. Conflict scoring runs detached afterwards.
    pub async fn trace(
        &self,
        claims: &Claims,
        request_id: &str,
        input: TraceInput,
    ) -> Result<TraceOutput, AppError> {
        if claims.agent_id != input.agent_id {
            if !claims.role.is_admin() {
                return Err(AppError::Forbidden(
                    "may only trace decisions for your own agent id".to_string(),
                ));
            }
            // Admin convenience: unknown agents are registered on first trace.
            self.ensure_agent(claims.org_id, &input.agent_id).await?;
        }

        // Provider calls happen before the transaction opens.
        let (topic_embedding, outcome_embedding) = self.embed_pair(&input.decision).await;

        let mut tx = self.pool.begin().await?;

        let run_id = match input.run_id {
            Some(run_id) => {
                let run: Option<Run> = sqlx::query_as(
                    r#"
                    SELECT id, agent_id, org_id, status, trace_id, metadata, started_at, completed_at
                    FROM runs
                    WHERE id = $1 AND org_id = $2
                    FOR UPDATE
                    "#,
                )
                .bind(run_id)
                .bind(claims.org_id)
                .fetch_optional(&mut *tx)
                .await?;
                let run = run.ok_or_else(|| AppError::NotFound("run not found".to_string()))?;
                if run.agent_id != input.agent_id {
                    return Err(AppError::Forbidden(
                        "run belongs to a different agent".to_string(),
                    ));
                }
                run.id
            }
            None => {
                let (run_id,): (Uuid,) = sqlx::query_as(
                    r#"
                    INSERT INTO runs (id, agent_id, org_id, status, trace_id, metadata, started_at)
                    VALUES (gen_random_uuid(), $1, $2, 'running', $3, '{}'::jsonb, NOW())
                    RETURNING id
                    "#,
                )
                .bind(&input.agent_id)
                .bind(claims.org_id)
                .bind(&input.trace_id)
                .fetch_one(&mut *tx)
                .await?;
                run_id
            }
        };

        let (decision_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO decisions (
                id, run_id, agent_id, org_id, decision_type, outcome, confidence,
                reasoning, session_id, topic_embedding, outcome_embedding, valid_from
            )
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(&input.agent_id)
        .bind(claims.org_id)
        .bind(&input.decision.decision_type)
        .bind(&input.decision.outcome)
        .bind(input.decision.confidence)
        .bind(&input.decision.reasoning)
        .bind(&input.session_id)
        .bind(&topic_embedding)
        .bind(&outcome_embedding)
        .fetch_one(&mut *tx)
        .await?;

        for (position, alternative) in input.decision.alternatives.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO decision_alternatives (decision_id, position, outcome, score, selected)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(decision_id)
            .bind(position as i32)
            .bind(&alternative.outcome)
            .bind(alternative.score)
            .bind(alternative.selected)
            .execute(&mut *tx)
            .await?;
        }

        for (position, evidence) in input.decision.evidence.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO decision_evidence (decision_id, position, source, content)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(decision_id)
            .bind(position as i32)
            .bind(&evidence.source)
            .bind(&evidence.content)
            .execute(&mut *tx)
            .await?;
        }

        let (event_count,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM run_events WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO run_events (id, run_id, event_type, payload, sequence, created_at)
            VALUES (gen_random_uuid(), $1, 'decision_made', $2, $3, NOW())
            "#,
        )
        .bind(run_id)
        .bind(serde_json::json!({
            "decision_id": decision_id,
            "decision_type": input.decision.decision_type,
            "outcome": input.decision.outcome,
            "confidence": input.decision.confidence,
        }))
        .bind(event_count)
        .execute(&mut *tx)
        .await?;

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(request_id.to_string()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "POST".to_string(),
                endpoint: "/v1/trace".to_string(),
                operation: "trace_decision".to_string(),
                resource_type: "decision".to_string(),
                resource_id: Some(decision_id.to_string()),
                before_state: None,
                after_state: None,
                metadata: serde_json::json!({"run_id": run_id, "agent_id": input.agent_id}),
            },
        )
        .await?;

        // NOTIFY rides the transaction: subscribers only see it post-commit.
        let payload = serde_json::json!({
            "org_id": claims.org_id,
            "decision_id": decision_id,
            "run_id": run_id,
            "agent_id": input.agent_id,
        });
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(DECISIONS_CHANNEL)
            .bind(payload.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let scorer = self.scorer.clone();
        tokio::spawn(async move {
            scorer.score_decision(decision_id).await;
        });

        Ok(TraceOutput {
            run_id,
            decision_id,
            event_count,
        })
    }

    /// Keyword search with optional semantic re-ranking, post-filtered by the
    /// caller's granted set.
    pub async fn search(
        &self,
        claims: &Claims,
        request: SearchRequest,
    ) -> Result<Vec<SearchHit>, AppError> {
        let granted = authz::load_granted_set(&self.pool, claims).await?;
        if granted.is_empty() {
            return Ok(vec![]);
        }
        let filter = granted.as_filter();
        let limit = validation::clamp_limit(request.limit);
        let pattern = format!("%{}%", escape_like(&request.query));

        let keyword_matches: Vec<Decision> = sqlx::query_as(&format!(
            r#"
            SELECT {DECISION_COLUMNS}
            FROM decisions
            WHERE org_id = $1
              AND ($2::text[] IS NULL OR agent_id = ANY($2))
              AND (outcome ILIKE $3 OR decision_type ILIKE $3 OR COALESCE(reasoning, '') ILIKE $3)
            ORDER BY valid_from DESC
            LIMIT $4
            "#
        ))
        .bind(claims.org_id)
        .bind(&filter)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: HashMap<Uuid, SearchHit> = keyword_matches
            .into_iter()
            .map(|d| {
                (
                    d.id,
                    SearchHit {
                        decision: d,
                        score: 0.4,
                    },
                )
            })
            .collect();

        if request.semantic && self.embedder.is_active() {
            match self.embedder.embed(&request.query).await {
                Ok(query_embedding) => {
                    let candidates: Vec<Decision> = sqlx::query_as(&format!(
                        r#"
                        SELECT {DECISION_COLUMNS}
                        FROM decisions
                        WHERE org_id = $1
                          AND ($2::text[] IS NULL OR agent_id = ANY($2))
                          AND topic_embedding IS NOT NULL
                        ORDER BY valid_from DESC
                        LIMIT 200
                        "#
                    ))
                    .bind(claims.org_id)
                    .bind(&filter)
                    .fetch_all(&self.pool)
                    .await?;

                    for candidate in candidates {
                        let Some(embedding) = &candidate.topic_embedding else {
                            continue;
                        };
                        let similarity = cosine_similarity(&query_embedding, embedding);
                        if similarity < 0.5 {
                            continue;
                        }
                        hits.entry(candidate.id)
                            .and_modify(|hit| hit.score += similarity * 0.6)
                            .or_insert(SearchHit {
                                decision: candidate,
                                score: similarity * 0.6,
                            });
                    }
                }
                Err(e) => warn!(error = %e, "semantic search degraded to keyword only"),
            }
        }

        let mut results: Vec<SearchHit> = hits.into_values().collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit as usize);
        Ok(results)
    }

    /// Preview whether a hypothetical decision would collide with recorded
    /// ones: returns the closest prior decisions and a conflict hint.
    pub async fn check(
        &self,
        claims: &Claims,
        request: CheckRequest,
    ) -> Result<CheckOutput, AppError> {
        let granted = authz::load_granted_set(&self.pool, claims).await?;
        if granted.is_empty() {
            return Ok(CheckOutput {
                matches: vec![],
                would_conflict: false,
            });
        }
        let filter = granted.as_filter();
        let limit = validation::clamp_limit(request.limit);

        let candidates: Vec<Decision> = sqlx::query_as(&format!(
            r#"
            SELECT {DECISION_COLUMNS}
            FROM decisions
            WHERE org_id = $1
              AND ($2::text[] IS NULL OR agent_id = ANY($2))
              AND ($3::text IS NULL OR agent_id = $3)
              AND decision_type = $4
            ORDER BY valid_from DESC
            LIMIT 200
            "#
        ))
        .bind(claims.org_id)
        .bind(&filter)
        .bind(&request.agent_id)
        .bind(&request.decision_type)
        .fetch_all(&self.pool)
        .await?;

        let topic_text = request
            .topic
            .clone()
            .unwrap_or_else(|| format!("{}: {}", request.decision_type, request.outcome));
        let query_embedding = if self.embedder.is_active() {
            self.embedder.embed(&topic_text).await.ok()
        } else {
            None
        };

        let floor = self.scorer.config().topic_floor;
        let mut matches: Vec<CheckMatch> = candidates
            .into_iter()
            .map(|decision| {
                let topic_similarity = match (&query_embedding, &decision.topic_embedding) {
                    (Some(query), Some(topic)) => Some(cosine_similarity(query, topic)),
                    _ => None,
                };
                let outcome_matches = decision
                    .outcome
                    .trim()
                    .eq_ignore_ascii_case(request.outcome.trim());
                CheckMatch {
                    decision,
                    topic_similarity,
                    outcome_matches,
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.topic_similarity
                .unwrap_or(0.0)
                .total_cmp(&a.topic_similarity.unwrap_or(0.0))
        });
        matches.truncate(limit as usize);

        let would_conflict = matches.iter().any(|m| {
            !m.outcome_matches
                && match m.topic_similarity {
                    Some(similarity) => similarity >= floor,
                    // Without embeddings, a same-type decision with a
                    // different outcome is the best available signal.
                    None => true,
                }
        });

        Ok(CheckOutput {
            matches,
            would_conflict,
        })
    }

    async fn ensure_agent(&self, org_id: Uuid, agent_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at)
            VALUES (gen_random_uuid(), $1, $2, 'agent', NULL, '{}', '{}'::jsonb, NOW())
            ON CONFLICT (org_id, agent_id) DO NOTHING
            "#,
        )
        .bind(org_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Topic and outcome embeddings are all-or-nothing; a provider failure
    /// degrades the decision to unscored rather than half-embedded.
    async fn embed_pair(&self, input: &DecisionInput) -> (Option<Vec<f32>>, Option<Vec<f32>>) {
        if !self.embedder.is_active() {
            return (None, None);
        }
        let topic_text = input
            .topic
            .clone()
            .unwrap_or_else(|| format!("{}: {}", input.decision_type, input.outcome));

        let topic = self.embedder.embed(&topic_text).await;
        let outcome = self.embedder.embed(&input.outcome).await;
        match (topic, outcome) {
            (Ok(topic), Ok(outcome)) => (Some(topic), Some(outcome)),
            (topic, outcome) => {
                if let Err(e) = topic.and(outcome) {
                    warn!(error = %e, "embedding failed; storing decision without embeddings");
                }
                (None, None)
            }
        }
    }
}

/// Escape `%`, `_`, and `\` so user input cannot inject LIKE wildcards.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_escaping_neutralizes_wildcards() {
        assert_eq!(escape_like("50%_done"), "50\\%\\_done");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn trace_input_validation_rules() {
        let valid: TraceInput = serde_json::from_value(serde_json::json!({
            "agent_id": "alice",
            "decision": {
                "decision_type": "security",
                "outcome": "Use JWT",
                "confidence": 0.9
            }
        }))
        .unwrap();
        assert!(valid.validate().is_ok());

        let bad_confidence: TraceInput = serde_json::from_value(serde_json::json!({
            "agent_id": "alice",
            "decision": {
                "decision_type": "security",
                "outcome": "Use JWT",
                "confidence": 1.5
            }
        }))
        .unwrap();
        assert!(bad_confidence.validate().is_err());

        let bad_agent: TraceInput = serde_json::from_value(serde_json::json!({
            "agent_id": "bad:colon",
            "decision": {
                "decision_type": "security",
                "outcome": "Use JWT",
                "confidence": 0.5
            }
        }))
        .unwrap();
        assert!(bad_agent.validate().is_err());

        let empty_outcome: TraceInput = serde_json::from_value(serde_json::json!({
            "agent_id": "alice",
            "decision": {
                "decision_type": "security",
                "outcome": "",
                "confidence": 0.5
            }
        }))
        .unwrap();
        assert!(empty_outcome.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<TraceInput, _> = serde_json::from_value(serde_json::json!({
            "agent_id": "alice",
            "surprise": true,
            "decision": {
                "decision_type": "security",
                "outcome": "Use JWT",
                "confidence": 0.9
            }
        }));
        assert!(result.is_err());
    }
}
