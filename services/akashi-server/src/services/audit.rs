use std::time::Duration;

use akashi_models::MutationAudit;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;

/// Linear backoff for detached audit writes: 50ms, 100ms, 150ms.
const RETRY_DELAYS_MS: [u64; 3] = [50, 100, 150];

/// Budget for the whole detached write including retries.
const DETACHED_TIMEOUT: Duration = Duration::from_secs(5);

async fn insert_audit<'e, E>(executor: E, entry: &MutationAudit) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO mutation_audit (
            id, request_id, org_id, actor_agent_id, actor_role,
            method, endpoint, operation, resource_type, resource_id,
            before_state, after_state, metadata, created_at
        )
        VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
        "#,
    )
    .bind(&entry.request_id)
    .bind(entry.org_id)
    .bind(&entry.actor_agent_id)
    .bind(&entry.actor_role)
    .bind(&entry.method)
    .bind(&entry.endpoint)
    .bind(&entry.operation)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(&entry.before_state)
    .bind(&entry.after_state)
    .bind(&entry.metadata)
    .execute(executor)
    .await?;
    Ok(())
}

/// Write an audit row inside the mutation's own transaction.
pub async fn record_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: &MutationAudit,
) -> Result<(), sqlx::Error> {
    insert_audit(&mut **tx, entry).await
}

/// Best-effort audit write on a detached task. Used by the append-events
/// path, where the mutation commits through the buffer and must never be
/// failed (or delayed) by auditing. Failures are logged, never surfaced.
pub fn record_detached(pool: PgPool, entry: MutationAudit) {
    tokio::spawn(async move {
        let write = async {
            let mut last_err: Option<sqlx::Error> = None;
            for delay_ms in RETRY_DELAYS_MS {
                match insert_audit(&pool, &entry).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        last_err = Some(e);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
            Err(last_err.unwrap_or(sqlx::Error::PoolClosed))
        };

        match tokio::time::timeout(DETACHED_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(endpoint = %entry.endpoint, error = %e, "audit write failed after retries");
            }
            Err(_) => {
                error!(endpoint = %entry.endpoint, "audit write timed out");
            }
        }
    });
}
