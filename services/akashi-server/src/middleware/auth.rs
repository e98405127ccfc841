use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest, ResponseError,
};
use akashi_common::{AppError, HttpError, RequestId};
use akashi_models::Agent;
use chrono::Utc;
use futures::future::LocalBoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::api_keys::{authenticate_api_key, parse_api_key_header, ApiKeyVerifier};
use crate::services::jwt::{Claims, JwtManager, AUDIENCE, ISSUER};

/// Endpoints reachable without credentials.
fn is_public(path: &str) -> bool {
    path == "/health" || path == "/openapi.yaml" || path == "/metrics" || path == "/auth/token"
}

/// Authenticates `Bearer <jwt>` and `ApiKey agent_id:secret` credentials and
/// parks the resulting claims in request extensions.
pub struct AuthMiddleware {
    jwt: Arc<JwtManager>,
    verifier: Arc<ApiKeyVerifier>,
    pool: PgPool,
}

impl AuthMiddleware {
    pub fn new(jwt: Arc<JwtManager>, verifier: Arc<ApiKeyVerifier>, pool: PgPool) -> Self {
        Self {
            jwt,
            verifier,
            pool,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service: Rc::new(service),
            jwt: self.jwt.clone(),
            verifier: self.verifier.clone(),
            pool: self.pool.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: Rc<S>,
    jwt: Arc<JwtManager>,
    verifier: Arc<ApiKeyVerifier>,
    pool: PgPool,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        if is_public(req.path()) {
            return Box::pin(async move {
                service
                    .call(req)
                    .await
                    .map(ServiceResponse::map_into_left_body)
            });
        }

        let jwt = self.jwt.clone();
        let verifier = self.verifier.clone();
        let pool = self.pool.clone();
        let header = req
            .headers()
            .get("Authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Box::pin(async move {
            match authenticate(&jwt, &verifier, &pool, header.as_deref()).await {
                Ok(claims) => {
                    req.extensions_mut().insert(claims);
                    service
                        .call(req)
                        .await
                        .map(ServiceResponse::map_into_left_body)
                }
                Err(error) => {
                    let request_id = req.extensions().get::<RequestId>().map(|r| r.0.clone());
                    let response = HttpError { error, request_id }.error_response();
                    let (http_req, _payload) = req.into_parts();
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
            }
        })
    }
}

async fn authenticate(
    jwt: &JwtManager,
    verifier: &Arc<ApiKeyVerifier>,
    pool: &PgPool,
    header: Option<&str>,
) -> Result<Claims, AppError> {
    let header =
        header.ok_or_else(|| AppError::Unauthorized("missing authorization header".to_string()))?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        return jwt.verify(token);
    }

    if let Some((agent_id, secret)) = parse_api_key_header(header) {
        let agent = authenticate_api_key(verifier, pool, agent_id, secret).await?;
        return Ok(claims_for_api_key(&agent));
    }

    Err(AppError::Unauthorized(
        "unsupported authorization scheme".to_string(),
    ))
}

fn claims_for_api_key(agent: &Agent) -> Claims {
    let now = Utc::now().timestamp();
    Claims {
        sub: agent.id.to_string(),
        agent_id: agent.agent_id.clone(),
        org_id: agent.org_id,
        role: agent.role(),
        api_key_id: Some(agent.id),
        scoped_by: None,
        iss: ISSUER.to_string(),
        aud: vec![AUDIENCE.to_string()],
        iat: now,
        exp: now,
    }
}

/// Extractor handing handlers the authenticated principal.
pub struct Identity(pub Claims);

impl FromRequest for Identity {
    type Error = HttpError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let claims = req.extensions().get::<Claims>().cloned();
        ready(match claims {
            Some(claims) => Ok(Identity(claims)),
            None => {
                let request_id = req
                    .extensions()
                    .get::<RequestId>()
                    .map(|r| r.0.clone())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                Err(HttpError::new(
                    AppError::Unauthorized("authentication required".to_string()),
                    request_id,
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_skip_authentication() {
        assert!(is_public("/health"));
        assert!(is_public("/openapi.yaml"));
        assert!(is_public("/metrics"));
        assert!(is_public("/auth/token"));
        // Scoped token minting requires an authenticated admin.
        assert!(!is_public("/auth/token/scoped"));
        assert!(!is_public("/v1/trace"));
    }
}
