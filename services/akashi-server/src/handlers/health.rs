use actix_web::{get, web, HttpResponse};
use akashi_common::{AppError, HttpError, RequestMeta};
use sqlx::PgPool;

use crate::metrics;

#[get("/health")]
pub async fn health(
    meta: RequestMeta,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, HttpError> {
    akashi_database::health_check(pool.get_ref())
        .await
        .map_err(|e| meta.fail(AppError::Unavailable(format!("database unavailable: {}", e))))?;
    Ok(meta.ok(serde_json::json!({"status": "ok"})))
}

#[get("/openapi.yaml")]
pub async fn openapi() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/yaml")
        .body(include_str!("../../openapi.yaml"))
}

#[get("/metrics")]
pub async fn metrics_endpoint() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(openapi).service(metrics_endpoint);
}
