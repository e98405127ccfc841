use actix_web::{get, web, HttpResponse};
use akashi_common::{HttpError, RequestMeta};
use akashi_models::{Decision, Role};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::middleware::Identity;

const PAGE_SIZE: i64 = 500;

/// Admin-only NDJSON dump of the org's decisions, streamed with keyset
/// pagination on `(valid_from, id)` so memory stays flat regardless of size.
#[get("/v1/export/decisions")]
pub async fn export_decisions(
    meta: RequestMeta,
    identity: Identity,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    claims.require(Role::Admin).map_err(|e| meta.fail(e))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<web::Bytes, std::convert::Infallible>>(16);
    let pool = pool.get_ref().clone();
    let org_id = claims.org_id;

    tokio::spawn(async move {
        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;
        loop {
            let page: Result<Vec<Decision>, sqlx::Error> = match cursor {
                None => {
                    sqlx::query_as(
                        r#"
                        SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence,
                               reasoning, session_id, topic_embedding, outcome_embedding, valid_from
                        FROM decisions
                        WHERE org_id = $1
                        ORDER BY valid_from ASC, id ASC
                        LIMIT $2
                        "#,
                    )
                    .bind(org_id)
                    .bind(PAGE_SIZE)
                    .fetch_all(&pool)
                    .await
                }
                Some((valid_from, id)) => {
                    sqlx::query_as(
                        r#"
                        SELECT id, run_id, agent_id, org_id, decision_type, outcome, confidence,
                               reasoning, session_id, topic_embedding, outcome_embedding, valid_from
                        FROM decisions
                        WHERE org_id = $1 AND (valid_from, id) > ($2, $3)
                        ORDER BY valid_from ASC, id ASC
                        LIMIT $4
                        "#,
                    )
                    .bind(org_id)
                    .bind(valid_from)
                    .bind(id)
                    .bind(PAGE_SIZE)
                    .fetch_all(&pool)
                    .await
                }
            };

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "export stream aborted");
                    return;
                }
            };
            if page.is_empty() {
                return;
            }
            cursor = page.last().map(|d| (d.valid_from, d.id));

            for decision in page {
                let mut line = match serde_json::to_string(&decision) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "export serialization failed");
                        return;
                    }
                };
                line.push('\n');
                if tx.send(Ok(web::Bytes::from(line))).await.is_err() {
                    // Client went away.
                    return;
                }
            }
        }
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(ReceiverStream::new(rx)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(export_decisions);
}
