use actix_web::{get, post, web, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{ConflictStatus, MutationAudit, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::middleware::Identity;
use crate::services::audit;
use crate::services::authz;

#[derive(Debug, Deserialize)]
pub struct ConflictQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConflictStatusRequest {
    pub status: String,
}

/// Conflict row joined with both decisions' agent ids, which the auth filter
/// needs: a caller must be able to read both sides.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConflictView {
    pub id: Uuid,
    pub org_id: Uuid,
    pub decision_a_id: Uuid,
    pub decision_b_id: Uuid,
    pub agent_a: String,
    pub agent_b: String,
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

const CONFLICT_VIEW_SQL: &str = r#"
    SELECT c.id, c.org_id, c.decision_a_id, c.decision_b_id,
           da.agent_id AS agent_a, db.agent_id AS agent_b,
           c.conflict_kind, c.scoring_method, c.relationship, c.category,
           c.severity, c.explanation, c.confidence_weight, c.temporal_decay,
           c.status, c.created_at
    FROM decision_conflicts c
    JOIN decisions da ON da.id = c.decision_a_id
    JOIN decisions db ON db.id = c.decision_b_id
"#;

#[get("/v1/conflicts")]
pub async fn list_conflicts(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    query: web::Query<ConflictQuery>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let limit = validation::clamp_limit(query.limit);
    let offset = validation::clamp_offset(query.offset);

    if let Some(ref status) = query.status {
        if status.parse::<ConflictStatus>().is_err() {
            return Err(meta.fail(AppError::Validation(
                "status must be open, resolved, or dismissed".to_string(),
            )));
        }
    }

    let granted = authz::load_granted_set(pool.get_ref(), &claims)
        .await
        .map_err(|e| meta.fail(e))?;
    if granted.is_empty() {
        return Ok(meta.ok(serde_json::json!({
            "conflicts": [],
            "limit": limit,
            "offset": offset,
        })));
    }

    let sql = format!(
        "{CONFLICT_VIEW_SQL} WHERE c.org_id = $1 AND ($2::text IS NULL OR c.status = $2) \
         ORDER BY c.created_at DESC LIMIT $3 OFFSET $4"
    );
    let rows: Vec<ConflictView> = sqlx::query_as(&sql)
        .bind(claims.org_id)
        .bind(&query.status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool.get_ref())
        .await
        .map_err(|e| meta.fail(e))?;

    let conflicts: Vec<ConflictView> = rows
        .into_iter()
        .filter(|c| granted.allows_pair(&c.agent_a, &c.agent_b))
        .collect();

    Ok(meta.ok(serde_json::json!({
        "conflicts": conflicts,
        "limit": limit,
        "offset": offset,
    })))
}

/// Move an open conflict to resolved or dismissed.
#[post("/v1/conflicts/{conflict_id}/status")]
pub async fn update_conflict_status(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
    body: web::Json<ConflictStatusRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let conflict_id = path.into_inner();
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;

    let new_status = body
        .status
        .parse::<ConflictStatus>()
        .ok()
        .filter(|s| matches!(s, ConflictStatus::Resolved | ConflictStatus::Dismissed))
        .ok_or_else(|| {
            meta.fail(AppError::Validation(
                "status must be 'resolved' or 'dismissed'".to_string(),
            ))
        })?;

    let sql = format!("{CONFLICT_VIEW_SQL} WHERE c.id = $1 AND c.org_id = $2");
    let conflict: Option<ConflictView> = sqlx::query_as(&sql)
        .bind(conflict_id)
        .bind(claims.org_id)
        .fetch_optional(pool.get_ref())
        .await
        .map_err(|e| meta.fail(e))?;
    let conflict =
        conflict.ok_or_else(|| meta.fail(AppError::NotFound("conflict not found".to_string())))?;

    let granted = authz::load_granted_set(pool.get_ref(), &claims)
        .await
        .map_err(|e| meta.fail(e))?;
    if !granted.allows_pair(&conflict.agent_a, &conflict.agent_b) {
        return Err(meta.fail(AppError::Forbidden(
            "no access to both sides of this conflict".to_string(),
        )));
    }

    let result: Result<(), AppError> = async {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "UPDATE decision_conflicts SET status = $3 WHERE id = $1 AND org_id = $2",
        )
        .bind(conflict_id)
        .bind(claims.org_id)
        .bind(new_status.to_string())
        .execute(&mut *tx)
        .await?;

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(meta.request_id.clone()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "POST".to_string(),
                endpoint: "/v1/conflicts/{conflict_id}/status".to_string(),
                operation: "update_conflict_status".to_string(),
                resource_type: "conflict".to_string(),
                resource_id: Some(conflict_id.to_string()),
                before_state: Some(serde_json::json!({"status": conflict.status})),
                after_state: Some(serde_json::json!({"status": new_status.to_string()})),
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(meta.ok(serde_json::json!({
            "id": conflict_id,
            "status": new_status.to_string(),
        }))),
        Err(e) => Err(meta.fail(e)),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_conflicts).service(update_conflict_status);
}
