use actix_web::{get, http::StatusCode, post, web, HttpRequest, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{
    Decision, DecisionAlternative, DecisionEvidence, MutationAudit, NewRunEvent, Role, Run,
    RunEvent, RunStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::Identity;
use crate::services::audit;
use crate::services::authz;
use crate::services::buffer::EventBuffer;
use crate::services::idempotency::{Begin, IdempotencyController};
use crate::services::jwt::Claims;

/// Events returned by `GET /v1/runs/{run_id}` are capped; the response
/// carries a truncation flag when the cap is hit.
const MAX_RUN_EVENTS: i64 = 10_000;

/// Events accepted per append call.
const MAX_EVENTS_PER_APPEND: usize = 1_000;

pub fn idempotency_key(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateRunRequest {
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub agent_id: String,
    pub trace_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppendEventsRequest {
    pub events: Vec<NewRunEvent>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CompleteRunRequest {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionDetail {
    #[serde(flatten)]
    pub decision: Decision,
    pub alternatives: Vec<DecisionAlternative>,
    pub evidence: Vec<DecisionEvidence>,
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub events: Vec<RunEvent>,
    pub events_truncated: bool,
    pub decisions: Vec<DecisionDetail>,
}

async fn load_owned_run(
    pool: &PgPool,
    claims: &Claims,
    run_id: Uuid,
) -> Result<Run, AppError> {
    let run: Option<Run> = sqlx::query_as(
        r#"
        SELECT id, agent_id, org_id, status, trace_id, metadata, started_at, completed_at
        FROM runs
        WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(run_id)
    .bind(claims.org_id)
    .fetch_optional(pool)
    .await?;
    let run = run.ok_or_else(|| AppError::NotFound("run not found".to_string()))?;

    if run.agent_id != claims.agent_id && !claims.role.is_admin() {
        return Err(AppError::Forbidden(
            "run belongs to a different agent".to_string(),
        ));
    }
    Ok(run)
}

#[post("/v1/runs")]
pub async fn create_run(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    idempotency: web::Data<IdempotencyController>,
    req: HttpRequest,
    body: web::Json<CreateRunRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;
    if body.agent_id != claims.agent_id && !claims.role.is_admin() {
        return Err(meta.fail(AppError::Forbidden(
            "may only create runs for your own agent id".to_string(),
        )));
    }

    let payload = serde_json::to_value(&*body).unwrap_or_default();
    let begin = idempotency
        .begin(&claims, "POST /v1/runs", idempotency_key(&req), &payload)
        .await
        .map_err(|e| meta.fail(e))?;
    if let Begin::Replay { status, data } = begin {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        return Ok(meta.respond(status, data));
    }
    let guard = begin.into_guard();

    let result: Result<Run, AppError> = async {
        let mut tx = pool.begin().await?;
        let run: Run = sqlx::query_as(
            r#"
            INSERT INTO runs (id, agent_id, org_id, status, trace_id, metadata, started_at)
            VALUES (gen_random_uuid(), $1, $2, 'running', $3, $4, NOW())
            RETURNING id, agent_id, org_id, status, trace_id, metadata, started_at, completed_at
            "#,
        )
        .bind(&body.agent_id)
        .bind(claims.org_id)
        .bind(&body.trace_id)
        .bind(body.metadata.clone().unwrap_or(serde_json::json!({})))
        .fetch_one(&mut *tx)
        .await?;

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(meta.request_id.clone()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "POST".to_string(),
                endpoint: "/v1/runs".to_string(),
                operation: "create_run".to_string(),
                resource_type: "run".to_string(),
                resource_id: Some(run.id.to_string()),
                before_state: None,
                after_state: Some(serde_json::to_value(&run).unwrap_or_default()),
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(run)
    }
    .await;

    match result {
        Ok(run) => {
            let data = serde_json::to_value(&run).unwrap_or_default();
            if let Some(guard) = guard {
                guard.finalize(StatusCode::CREATED.as_u16(), data.clone());
            }
            Ok(meta.created(data))
        }
        Err(e) => {
            if let Some(guard) = guard {
                guard.abandon();
            }
            Err(meta.fail(e))
        }
    }
}

#[post("/v1/runs/{run_id}/events")]
pub async fn append_events(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    buffer: web::Data<EventBuffer>,
    idempotency: web::Data<IdempotencyController>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<AppendEventsRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let run_id = path.into_inner();
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;

    if body.events.is_empty() {
        return Err(meta.fail(AppError::Validation("events must be non-empty".to_string())));
    }
    if body.events.len() > MAX_EVENTS_PER_APPEND {
        return Err(meta.fail(AppError::Validation(format!(
            "at most {} events per append",
            MAX_EVENTS_PER_APPEND
        ))));
    }
    if body.events.iter().any(|e| e.event_type.is_empty()) {
        return Err(meta.fail(AppError::Validation(
            "event_type must be non-empty".to_string(),
        )));
    }

    let run = load_owned_run(pool.get_ref(), &claims, run_id)
        .await
        .map_err(|e| meta.fail(e))?;
    if run.status != RunStatus::Running.to_string() {
        return Err(meta.fail(AppError::Conflict("run is not running".to_string())));
    }

    let payload = serde_json::to_value(&*body).unwrap_or_default();
    let begin = idempotency
        .begin(
            &claims,
            "POST /v1/runs/{run_id}/events",
            idempotency_key(&req),
            &payload,
        )
        .await
        .map_err(|e| meta.fail(e))?;
    if let Begin::Replay { status, data } = begin {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        return Ok(meta.respond(status, data));
    }
    let guard = begin.into_guard();

    let events = body.into_inner().events;
    let accepted = events.len();

    let result: Result<Vec<Uuid>, AppError> = async {
        let ticket = buffer
            .append(run.id, claims.org_id, run.agent_id.clone(), events)
            .map_err(AppError::from)?;
        let ids = buffer.flush_now(ticket).await.map_err(AppError::from)?;
        Ok(ids)
    }
    .await;

    match result {
        Ok(event_ids) => {
            // The buffer commits its own transaction; auditing is documented
            // best-effort on this path.
            audit::record_detached(
                pool.get_ref().clone(),
                MutationAudit {
                    request_id: Some(meta.request_id.clone()),
                    org_id: claims.org_id,
                    actor_agent_id: claims.agent_id.clone(),
                    actor_role: claims.role.to_string(),
                    method: "POST".to_string(),
                    endpoint: "/v1/runs/{run_id}/events".to_string(),
                    operation: "append_events".to_string(),
                    resource_type: "run".to_string(),
                    resource_id: Some(run.id.to_string()),
                    before_state: None,
                    after_state: None,
                    metadata: serde_json::json!({"accepted": accepted}),
                },
            );

            let data = serde_json::json!({
                "accepted": accepted,
                "event_ids": event_ids,
            });
            if let Some(guard) = guard {
                guard.finalize(StatusCode::OK.as_u16(), data.clone());
            }
            Ok(meta.ok(data))
        }
        Err(e) => {
            if let Some(guard) = guard {
                guard.abandon();
            }
            Err(meta.fail(e))
        }
    }
}

#[post("/v1/runs/{run_id}/complete")]
pub async fn complete_run(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
    body: web::Json<CompleteRunRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let run_id = path.into_inner();
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;

    let status = body
        .status
        .clone()
        .unwrap_or_else(|| RunStatus::Completed.to_string());
    let status = status
        .parse::<RunStatus>()
        .ok()
        .filter(|s| matches!(s, RunStatus::Completed | RunStatus::Failed))
        .ok_or_else(|| {
            meta.fail(AppError::Validation(
                "status must be 'completed' or 'failed'".to_string(),
            ))
        })?;

    let result: Result<Run, AppError> = async {
        let mut tx = pool.begin().await?;
        let before: Option<Run> = sqlx::query_as(
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
        let before = before.ok_or_else(|| AppError::NotFound("run not found".to_string()))?;
        if before.agent_id != claims.agent_id && !claims.role.is_admin() {
            return Err(AppError::Forbidden(
                "run belongs to a different agent".to_string(),
            ));
        }

        let run: Run = sqlx::query_as(
            r#"
            UPDATE runs
            SET status = $3, completed_at = NOW()
            WHERE id = $1 AND org_id = $2
            RETURNING id, agent_id, org_id, status, trace_id, metadata, started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(claims.org_id)
        .bind(status.to_string())
        .fetch_one(&mut *tx)
        .await?;

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(meta.request_id.clone()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "POST".to_string(),
                endpoint: "/v1/runs/{run_id}/complete".to_string(),
                operation: "complete_run".to_string(),
                resource_type: "run".to_string(),
                resource_id: Some(run.id.to_string()),
                before_state: Some(serde_json::json!({"status": before.status})),
                after_state: Some(serde_json::json!({"status": run.status})),
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(run)
    }
    .await;

    match result {
        Ok(run) => Ok(meta.ok(run)),
        Err(e) => Err(meta.fail(e)),
    }
}

#[get("/v1/runs/{run_id}")]
pub async fn get_run(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let run_id = path.into_inner();

    let run: Option<Run> = sqlx::query_as(
        r#"
        SELECT id, agent_id, org_id, status, trace_id, metadata, started_at, completed_at
        FROM runs
        WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(run_id)
    .bind(claims.org_id)
    .fetch_optional(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;
    let run = run.ok_or_else(|| meta.fail(AppError::NotFound("run not found".to_string())))?;

    let readable = authz::can_read_agent(pool.get_ref(), &claims, &run.agent_id)
        .await
        .map_err(|e| meta.fail(e))?;
    if !readable {
        return Err(meta.fail(AppError::Forbidden(
            "no access to this agent's runs".to_string(),
        )));
    }

    let mut events: Vec<RunEvent> = sqlx::query_as(
        r#"
        SELECT id, run_id, event_type, payload, sequence, created_at
        FROM run_events
        WHERE run_id = $1
        ORDER BY sequence ASC
        LIMIT $2
        "#,
    )
    .bind(run_id)
    .bind(MAX_RUN_EVENTS + 1)
    .fetch_all(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;
    let events_truncated = events.len() as i64 > MAX_RUN_EVENTS;
    events.truncate(MAX_RUN_EVENTS as usize);

    let decisions: Vec<Decision> = sqlx::query_as(
        r#"
        SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence,
               reasoning, session_id, topic_embedding, outcome_embedding, valid_from
        FROM decisions
        WHERE run_id = $1
        ORDER BY valid_from ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;

    let decision_ids: Vec<Uuid> = decisions.iter().map(|d| d.id).collect();
    let alternatives: Vec<DecisionAlternative> = sqlx::query_as(
        r#"
        SELECT decision_id, position, outcome, score, selected
        FROM decision_alternatives
        WHERE decision_id = ANY($1)
        ORDER BY decision_id, position
        "#,
    )
    .bind(&decision_ids)
    .fetch_all(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;
    let evidence: Vec<DecisionEvidence> = sqlx::query_as(
        r#"
        SELECT decision_id, position, source, content
        FROM decision_evidence
        WHERE decision_id = ANY($1)
        ORDER BY decision_id, position
        "#,
    )
    .bind(&decision_ids)
    .fetch_all(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;

    let decisions: Vec<DecisionDetail> = decisions
        .into_iter()
        .map(|decision| {
            let alternatives = alternatives
                .iter()
                .filter(|a| a.decision_id == decision.id)
                .cloned()
                .collect();
            let evidence = evidence
                .iter()
                .filter(|e| e.decision_id == decision.id)
                .cloned()
                .collect();
            DecisionDetail {
                decision,
                alternatives,
                evidence,
            }
        })
        .collect();

    Ok(meta.ok(RunDetail {
        run,
        events,
        events_truncated,
        decisions,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(create_run)
        .service(append_events)
        .service(complete_run)
        .service(get_run);
}
