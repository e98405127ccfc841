use actix_web::{post, web, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{Agent, MutationAudit, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use validator::Validate;

use crate::middleware::Identity;
use crate::services::api_keys::{authenticate_api_key, ApiKeyVerifier};
use crate::services::audit;
use crate::services::jwt::JwtManager;

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub agent_id: String,
    #[validate(length(min = 1))]
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ScopedTokenRequest {
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub agent_id: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ScopedTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub scoped_by: String,
}

/// Exchange an API key for a bearer token.
#[post("/auth/token")]
pub async fn issue_token(
    meta: RequestMeta,
    pool: web::Data<PgPool>,
    jwt: web::Data<JwtManager>,
    verifier: web::Data<ApiKeyVerifier>,
    body: web::Json<TokenRequest>,
) -> Result<HttpResponse, HttpError> {
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let agent = authenticate_api_key(
        &verifier.clone().into_inner(),
        pool.get_ref(),
        &body.agent_id,
        &body.api_key,
    )
    .await
    .map_err(|e| meta.fail(e))?;

    let (token, expires_at) = jwt.issue(&agent).map_err(|e| meta.fail(e))?;
    Ok(meta.ok(TokenResponse { token, expires_at }))
}

/// Mint a short-lived token acting as another agent in the same org. The
/// minting admin is recorded in `scoped_by` and the TTL is capped.
#[post("/auth/token/scoped")]
pub async fn issue_scoped_token(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    jwt: web::Data<JwtManager>,
    body: web::Json<ScopedTokenRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Admin).map_err(|e| meta.fail(e))?;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let target: Option<Agent> = sqlx::query_as(
        r#"
        SELECT id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at
        FROM agents
        WHERE org_id = $1 AND agent_id = $2
        "#,
    )
    .bind(claims.org_id)
    .bind(&body.agent_id)
    .fetch_optional(pool.get_ref())
    .await
    .map_err(|e| meta.fail(e))?;
    let target = target
        .ok_or_else(|| meta.fail(AppError::NotFound("target agent not found".to_string())))?;

    let (token, expires_at) = jwt
        .issue_scoped(&claims, &target, body.ttl_seconds)
        .map_err(|e| meta.fail(e))?;

    audit::record_detached(
        pool.get_ref().clone(),
        MutationAudit {
            request_id: Some(meta.request_id.clone()),
            org_id: claims.org_id,
            actor_agent_id: claims.agent_id.clone(),
            actor_role: claims.role.to_string(),
            method: "POST".to_string(),
            endpoint: "/auth/token/scoped".to_string(),
            operation: "mint_scoped_token".to_string(),
            resource_type: "agent".to_string(),
            resource_id: Some(target.agent_id.clone()),
            before_state: None,
            after_state: None,
            metadata: serde_json::json!({"ttl_seconds": body.ttl_seconds}),
        },
    );

    Ok(meta.ok(ScopedTokenResponse {
        token,
        expires_at,
        scoped_by: claims.agent_id,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(issue_token).service(issue_scoped_token);
}
