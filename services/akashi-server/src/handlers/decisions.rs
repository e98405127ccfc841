use actix_web::{get, http::StatusCode, post, web, HttpRequest, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{Decision, Role};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::runs::idempotency_key;
use crate::middleware::Identity;
use crate::services::authz;
use crate::services::decisions::{CheckRequest, DecisionService, SearchRequest, TraceInput};
use crate::services::idempotency::{Begin, IdempotencyController};
use crate::services::jwt::Claims;

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    pub agent_id: Option<String>,
    pub decision_type: Option<String>,
    pub outcome: Option<String>,
    pub session_id: Option<String>,
    pub run_id: Option<Uuid>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: Option<f64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TemporalQueryRequest {
    pub as_of: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub decision_type: Option<String>,
    pub outcome: Option<String>,
    pub session_id: Option<String>,
    pub run_id: Option<Uuid>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: Option<f64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TemporalQueryRequest {
    fn into_parts(self) -> (QueryRequest, DateTime<Utc>) {
        (
            QueryRequest {
                agent_id: self.agent_id,
                decision_type: self.decision_type,
                outcome: self.outcome,
                session_id: self.session_id,
                run_id: self.run_id,
                min_confidence: self.min_confidence,
                limit: self.limit,
                offset: self.offset,
            },
            self.as_of,
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

/// Convenience ingest: run + decision + event in one call.
#[post("/v1/trace")]
pub async fn trace(
    meta: RequestMeta,
    identity: Identity,
    decisions: web::Data<DecisionService>,
    idempotency: web::Data<IdempotencyController>,
    req: HttpRequest,
    body: web::Json<TraceInput>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let payload = serde_json::to_value(&*body).unwrap_or_default();
    let begin = idempotency
        .begin(&claims, "POST /v1/trace", idempotency_key(&req), &payload)
        .await
        .map_err(|e| meta.fail(e))?;
    if let Begin::Replay { status, data } = begin {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        return Ok(meta.respond(status, data));
    }
    let guard = begin.into_guard();

    match decisions
        .trace(&claims, &meta.request_id, body.into_inner())
        .await
    {
        Ok(output) => {
            let data = serde_json::to_value(&output).unwrap_or_default();
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

async fn run_query(
    pool: &PgPool,
    claims: &Claims,
    query: &QueryRequest,
    as_of: Option<DateTime<Utc>>,
) -> Result<serde_json::Value, AppError> {
    let granted = authz::load_granted_set(pool, claims).await?;
    let limit = validation::clamp_limit(query.limit);
    let offset = validation::clamp_offset(query.offset);
    if granted.is_empty() {
        return Ok(serde_json::json!({
            "decisions": [],
            "limit": limit,
            "offset": offset,
        }));
    }
    let filter = granted.as_filter();

    // Dynamic filter assembly; every value still goes through a bind.
    let mut sql = String::from(
        "SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence, \
         reasoning, session_id, topic_embedding, outcome_embedding, valid_from \
         FROM decisions WHERE org_id = $1 AND ($2::text[] IS NULL OR agent_id = ANY($2))",
    );
    let mut bind_index = 3;

    if query.agent_id.is_some() {
        sql.push_str(&format!(" AND agent_id = ${}", bind_index));
        bind_index += 1;
    }
    if query.decision_type.is_some() {
        sql.push_str(&format!(" AND decision_type = ${}", bind_index));
        bind_index += 1;
    }
    if query.outcome.is_some() {
        sql.push_str(&format!(" AND outcome = ${}", bind_index));
        bind_index += 1;
    }
    if query.session_id.is_some() {
        sql.push_str(&format!(" AND session_id = ${}", bind_index));
        bind_index += 1;
    }
    if query.run_id.is_some() {
        sql.push_str(&format!(" AND run_id = ${}", bind_index));
        bind_index += 1;
    }
    if query.min_confidence.is_some() {
        sql.push_str(&format!(" AND confidence >= ${}", bind_index));
        bind_index += 1;
    }
    if as_of.is_some() {
        // Bitemporal read: only rows visible as of the requested instant.
        sql.push_str(&format!(" AND valid_from <= ${}", bind_index));
        bind_index += 1;
    }
    sql.push_str(&format!(
        " ORDER BY valid_from DESC LIMIT ${} OFFSET ${}",
        bind_index,
        bind_index + 1
    ));

    let mut query_builder = sqlx::query_as::<_, Decision>(&sql)
        .bind(claims.org_id)
        .bind(&filter);
    if let Some(ref agent_id) = query.agent_id {
        query_builder = query_builder.bind(agent_id);
    }
    if let Some(ref decision_type) = query.decision_type {
        query_builder = query_builder.bind(decision_type);
    }
    if let Some(ref outcome) = query.outcome {
        query_builder = query_builder.bind(outcome);
    }
    if let Some(ref session_id) = query.session_id {
        query_builder = query_builder.bind(session_id);
    }
    if let Some(run_id) = query.run_id {
        query_builder = query_builder.bind(run_id);
    }
    if let Some(min_confidence) = query.min_confidence {
        query_builder = query_builder.bind(min_confidence);
    }
    if let Some(as_of) = as_of {
        query_builder = query_builder.bind(as_of);
    }
    query_builder = query_builder.bind(limit).bind(offset);

    let decisions = query_builder.fetch_all(pool).await?;

    Ok(serde_json::json!({
        "decisions": decisions,
        "limit": limit,
        "offset": offset,
    }))
}

#[post("/v1/query")]
pub async fn query_decisions(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    body: web::Json<QueryRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let data = run_query(pool.get_ref(), &claims, &body, None)
        .await
        .map_err(|e| meta.fail(e))?;
    Ok(meta.ok(data))
}

#[post("/v1/query/temporal")]
pub async fn temporal_query(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    body: web::Json<TemporalQueryRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let (query, as_of) = body.into_inner().into_parts();
    let data = run_query(pool.get_ref(), &claims, &query, Some(as_of))
        .await
        .map_err(|e| meta.fail(e))?;
    Ok(meta.ok(data))
}

#[get("/v1/decisions/recent")]
pub async fn recent_decisions(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    query: web::Query<RecentQuery>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let request = QueryRequest {
        agent_id: None,
        decision_type: None,
        outcome: None,
        session_id: None,
        run_id: None,
        min_confidence: None,
        limit: query.limit,
        offset: None,
    };
    let data = run_query(pool.get_ref(), &claims, &request, None)
        .await
        .map_err(|e| meta.fail(e))?;
    Ok(meta.ok(data))
}

#[post("/v1/search")]
pub async fn search_decisions(
    meta: RequestMeta,
    identity: Identity,
    decisions: web::Data<DecisionService>,
    body: web::Json<SearchRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let hits = decisions
        .search(&claims, body.into_inner())
        .await
        .map_err(|e| meta.fail(e))?;
    Ok(meta.ok(serde_json::json!({ "hits": hits })))
}

#[post("/v1/check")]
pub async fn check_decision(
    meta: RequestMeta,
    identity: Identity,
    decisions: web::Data<DecisionService>,
    body: web::Json<CheckRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let output = decisions
        .check(&claims, body.into_inner())
        .await
        .map_err(|e| meta.fail(e))?;
    Ok(meta.ok(output))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(trace)
        .service(query_decisions)
        .service(temporal_query)
        .service(recent_decisions)
        .service(search_decisions)
        .service(check_decision);
}
