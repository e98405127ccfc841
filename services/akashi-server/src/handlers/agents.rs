use actix_web::{delete, post, web, HttpResponse};
use akashi_common::{validation, AppError, HttpError, RequestMeta};
use akashi_models::{Agent, MutationAudit, Role};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use validator::Validate;

use crate::middleware::Identity;
use crate::services::api_keys::{self, ApiKeyVerifier};
use crate::services::audit;

/// The bootstrap agent every deployment seeds; it can never be deleted.
pub const SEED_ADMIN: &str = "admin";

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateAgentRequest {
    #[validate(custom(function = "validation::validate_agent_id"))]
    pub agent_id: String,
    pub role: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateAgentResponse {
    pub agent: Agent,
    /// `agent_id:secret` credential, returned exactly once.
    pub api_key: String,
}

#[post("/v1/agents")]
pub async fn create_agent(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    verifier: web::Data<ApiKeyVerifier>,
    body: web::Json<CreateAgentRequest>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Admin).map_err(|e| meta.fail(e))?;
    body.validate()
        .map_err(|e| meta.fail(AppError::Validation(e.to_string())))?;

    let role = body
        .role
        .clone()
        .unwrap_or_else(|| Role::Agent.to_string());
    let role = role.parse::<Role>().map_err(|_| {
        meta.fail(AppError::Validation(format!("unknown role '{}'", role)))
    })?;
    // Nobody hands out a role above their own.
    if role > claims.role {
        return Err(meta.fail(AppError::Forbidden(
            "cannot create an agent with a higher role than your own".to_string(),
        )));
    }

    let secret = api_keys::generate_secret();
    let hash = {
        let verifier = verifier.clone().into_inner();
        let secret = secret.clone();
        web::block(move || verifier.hash_secret(&secret))
            .await
            .map_err(|e| meta.fail(AppError::Internal(format!("hashing failed: {}", e))))?
            .map_err(|e| meta.fail(e))?
    };

    let result: Result<Agent, AppError> = async {
        let mut tx = pool.begin().await?;
        let agent: Agent = sqlx::query_as(
            r#"
            INSERT INTO agents (id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, NOW())
            RETURNING id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at
            "#,
        )
        .bind(claims.org_id)
        .bind(&body.agent_id)
        .bind(role.to_string())
        .bind(&hash)
        .bind(&body.tags)
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
                endpoint: "/v1/agents".to_string(),
                operation: "create_agent".to_string(),
                resource_type: "agent".to_string(),
                resource_id: Some(agent.agent_id.clone()),
                before_state: None,
                after_state: Some(serde_json::json!({"role": agent.role, "tags": agent.tags})),
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(agent)
    }
    .await;

    match result {
        Ok(agent) => Ok(meta.created(CreateAgentResponse {
            api_key: format!("{}:{}", agent.agent_id, secret),
            agent,
        })),
        Err(e) => Err(meta.fail(e)),
    }
}

#[delete("/v1/agents/{agent_id}")]
pub async fn delete_agent(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
    path: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let agent_id = path.into_inner();
    claims.require(Role::Admin).map_err(|e| meta.fail(e))?;

    if agent_id == SEED_ADMIN {
        return Err(meta.fail(AppError::Forbidden(
            "the seed admin agent cannot be deleted".to_string(),
        )));
    }

    let result: Result<(), AppError> = async {
        let mut tx = pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM agents WHERE org_id = $1 AND agent_id = $2")
            .bind(claims.org_id)
            .bind(&agent_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AppError::NotFound("agent not found".to_string()));
        }

        audit::record_in_tx(
            &mut tx,
            &MutationAudit {
                request_id: Some(meta.request_id.clone()),
                org_id: claims.org_id,
                actor_agent_id: claims.agent_id.clone(),
                actor_role: claims.role.to_string(),
                method: "DELETE".to_string(),
                endpoint: "/v1/agents/{agent_id}".to_string(),
                operation: "delete_agent".to_string(),
                resource_type: "agent".to_string(),
                resource_id: Some(agent_id.clone()),
                before_state: None,
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
        Ok(()) => Ok(meta.ok(serde_json::json!({"deleted": agent_id}))),
        Err(e) => Err(meta.fail(e)),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(create_agent).service(delete_agent);
}
