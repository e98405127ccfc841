use actix_web::{delete, post, web, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{
    AccessGrant, MutationAudit, Role, PERMISSION_READ, RESOURCE_AGENT_TRACES,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::Identity;
use crate::services::audit;

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateGrantRequest {
    /// Agent receiving read access.
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub grantee_agent_id: String,
    /// Agent whose traces become readable.
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub target_agent_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[post("/v1/grants")]
pub async fn create_grant(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    body: web::Json<CreateGrantRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    // Non-admins may only delegate access to their own traces.
    if body.target_agent_id != claims.agent_id && !claims.role.is_admin() {
        return Err(meta.fail(AppError::Forbidden(
            "may only grant access to your own traces".to_string(),
        )));
    }
    if let Some(expires_at) = body.expires_at {
        if expires_at <= Utc::now() {
            return Err(meta.fail(AppError::Validation(
                "expires_at must be in the future".to_string(),
            )));
        }
    }

    let grantor_id = claims.subject_uuid().ok_or_else(|| {
        meta.fail(AppError::Unauthorized("malformed subject".to_string()))
    })?;

    let grantee: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM agents WHERE org_id = $1 AND agent_id = $2")
            .bind(claims.org_id)
            .bind(&body.grantee_agent_id)
            .fetch_optional(pool.get_ref())
            .await
            .map_err(|e| meta.fail(e))?;
    let (grantee_id,) = grantee
        .ok_or_else(|| meta.fail(AppError::NotFound("grantee agent not found".to_string())))?;

    let result: Result<AccessGrant, AppError> = async {
        let mut tx = pool.begin().await?;
        let grant: AccessGrant = sqlx::query_as(
            r#"
            INSERT INTO access_grants (
                id, org_id, grantor_id, grantee_id, resource_type, resource_id,
                permission, expires_at, created_at
            )
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id, org_id, grantor_id, grantee_id, resource_type, resource_id,
                      permission, expires_at, created_at
            "#,
        )
        .bind(claims.org_id)
        .bind(grantor_id)
        .bind(grantee_id)
        .bind(RESOURCE_AGENT_TRACES)
        .bind(&body.target_agent_id)
        .bind(PERMISSION_READ)
        .bind(body.expires_at)
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
                endpoint: "/v1/grants".to_string(),
                operation: "create_grant".to_string(),
                resource_type: "access_grant".to_string(),
                resource_id: Some(grant.id.to_string()),
                before_state: None,
                after_state: Some(serde_json::json!({
                    "grantee": body.grantee_agent_id,
                    "target": body.target_agent_id,
                    "expires_at": body.expires_at,
                })),
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(grant)
    }
    .await;

    match result {
        Ok(grant) => Ok(meta.created(grant)),
        Err(e) => Err(meta.fail(e)),
    }
}

#[delete("/v1/grants/{grant_id}")]
pub async fn delete_grant(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let grant_id = path.into_inner();
    claims.require(Role::Agent).map_err(|e| meta.fail(e))?;

    let grant: Option<AccessGrant> = sqlx::query_as(
        r#"
        SELECT id, org_id, grantor_id, grantee_id, resource_type, resource_id,
               permission, expires_at, created_at
        FROM access_grants
        WHERE id = $1 AND org_id = $2
        "#,
    )
    .bind(grant_id)
    .bind(claims.org_id)
    .fetch_optional(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;
    let grant =
        grant.ok_or_else(|| meta.fail(AppError::NotFound("grant not found".to_string())))?;

    // Grantor or admin+ may revoke.
    let is_grantor = claims.subject_uuid() == Some(grant.grantor_id);
    if !is_grantor && !claims.role.is_admin() {
        return Err(meta.fail(AppError::Forbidden(
            "only the grantor or an admin may revoke a grant".to_string(),
        )));
    }

    let result: Result<(), AppError> = async {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM access_grants WHERE id = $1 AND org_id = $2")
            .bind(grant_id)
            .bind(claims.org_id)
            .execute(&mut *tx)
            .await?;

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(meta.request_id.clone()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "DELETE".to_string(),
                endpoint: "/v1/grants/{grant_id}".to_string(),
                operation: "delete_grant".to_string(),
                resource_type: "access_grant".to_string(),
                resource_id: Some(grant_id.to_string()),
                before_state: Some(serde_json::to_value(&grant).unwrap_or_default()),
                after_state: None,
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(meta.ok(serde_json::json!({"deleted": grant_id}))),
        Err(e) => Err(meta.fail(e)),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(create_grant).service(delete_grant);
}
