use std::time::Duration;

use akashi_common::AppError;
use akashi_models::{IdempotencyRecord, IdempotencyStatus};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::services::jwt::Claims;

/// Linear backoff for finalize/clear: 50ms, 100ms, 150ms.
const RETRY_DELAYS_MS: [u64; 3] = [50, 100, 150];

/// Budget for detached finalize/clear operations. They run on a background
/// task so request cancellation cannot roll back a committed mutation's
/// bookkeeping.
const DETACHED_TIMEOUT: Duration = Duration::from_secs(10);

/// SHA-256 over the JCS-canonicalized payload, so key order and whitespace
/// differences do not defeat replay detection.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let canonical = serde_jcs::to_string(payload).unwrap_or_else(|_| payload.to_string());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of an idempotency lookup for one request.
pub enum Begin {
    /// No Idempotency-Key header; run the handler normally.
    NotKeyed,
    /// Fresh (or taken-over) reservation; run the handler, then finalize.
    Proceed(ReservationGuard),
    /// Same key and payload already completed; replay the captured response.
    Replay {
        status: u16,
        data: serde_json::Value,
    },
}

impl Begin {
    pub fn into_guard(self) -> Option<ReservationGuard> {
        match self {
            Begin::Proceed(guard) => Some(guard),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyController {
    pool: PgPool,
    ttl_seconds: i64,
}

impl IdempotencyController {
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }

    /// Reserve, replay, or reject. Reservation and takeover are single
    /// statements so concurrent retries cannot both proceed.
    pub async fn begin(
        &self,
        claims: &Claims,
        endpoint: &str,
        key: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<Begin, AppError> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Ok(Begin::NotKeyed);
        };
        if key.len() > 255 {
            return Err(AppError::Validation(
                "Idempotency-Key must be at most 255 characters".to_string(),
            ));
        }

        let hash = payload_hash(payload);

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (
                org_id, agent_id, endpoint, idem_key, request_hash,
                status, created_at, completes_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW() + make_interval(secs => $7))
            ON CONFLICT (org_id, agent_id, endpoint, idem_key) DO NOTHING
            "#,
        )
        .bind(claims.org_id)
        .bind(&claims.agent_id)
        .bind(endpoint)
        .bind(key)
        .bind(&hash)
        .bind(IdempotencyStatus::InProgress.to_string())
        .bind(self.ttl_seconds as f64)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(Begin::Proceed(self.guard(claims, endpoint, key)));
        }

        let existing: Option<IdempotencyRecord> = sqlx::query_as(
            r#"
            SELECT org_id, agent_id, endpoint, idem_key, request_hash, status,
                   response_status, response_body, created_at, completes_at
            FROM idempotency_keys
            WHERE org_id = $1 AND agent_id = $2 AND endpoint = $3 AND idem_key = $4
            "#,
        )
        .bind(claims.org_id)
        .bind(&claims.agent_id)
        .bind(endpoint)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = existing else {
            // Record vanished between insert and select (cleared by a failed
            // handler); treat as a fresh retryable state.
            return Err(AppError::Conflict(
                "idempotency key state changed; retry".to_string(),
            ));
        };

        if record.request_hash != hash {
            return Err(AppError::Conflict(
                "Idempotency-Key reused with a different payload".to_string(),
            ));
        }

        if record.status == IdempotencyStatus::Completed.to_string() {
            let status_code = record.response_status.unwrap_or(200).clamp(100, 599) as u16;
            return Ok(Begin::Replay {
                status: status_code,
                data: record.response_body.unwrap_or(serde_json::Value::Null),
            });
        }

        // Same payload, still in progress. A record past its TTL is presumed
        // stuck and taken over; otherwise the retry is premature.
        let taken_over = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET created_at = NOW(), completes_at = NOW() + make_interval(secs => $5)
            WHERE org_id = $1 AND agent_id = $2 AND endpoint = $3 AND idem_key = $4
              AND status = $6 AND completes_at < NOW()
            "#,
        )
        .bind(claims.org_id)
        .bind(&claims.agent_id)
        .bind(endpoint)
        .bind(key)
        .bind(self.ttl_seconds as f64)
        .bind(IdempotencyStatus::InProgress.to_string())
        .execute(&self.pool)
        .await?;

        if taken_over.rows_affected() == 1 {
            Ok(Begin::Proceed(self.guard(claims, endpoint, key)))
        } else {
            Err(AppError::Conflict(
                "request with this Idempotency-Key is already in progress".to_string(),
            ))
        }
    }

    fn guard(&self, claims: &Claims, endpoint: &str, key: &str) -> ReservationGuard {
        ReservationGuard {
            pool: self.pool.clone(),
            org_id: claims.org_id,
            agent_id: claims.agent_id.clone(),
            endpoint: endpoint.to_string(),
            key: key.to_string(),
        }
    }
}

/// Handle to an in-progress reservation. `finalize` captures the response for
/// replay; `abandon` clears the record so a retry can start fresh. Both run
/// detached with a bounded timeout.
pub struct ReservationGuard {
    pool: PgPool,
    org_id: Uuid,
    agent_id: String,
    endpoint: String,
    key: String,
}

impl ReservationGuard {
    pub fn finalize(self, status: u16, data: serde_json::Value) {
        tokio::spawn(async move {
            let finalize = async {
                let mut last_err: Option<sqlx::Error> = None;
                for delay_ms in RETRY_DELAYS_MS {
                    let result = sqlx::query(
                        r#"
                        UPDATE idempotency_keys
                        SET status = 'completed', response_status = $5, response_body = $6
                        WHERE org_id = $1 AND agent_id = $2 AND endpoint = $3 AND idem_key = $4
                          AND status = 'in_progress'
                        "#,
                    )
                    .bind(self.org_id)
                    .bind(&self.agent_id)
                    .bind(&self.endpoint)
                    .bind(&self.key)
                    .bind(status as i32)
                    .bind(&data)
                    .execute(&self.pool)
                    .await;
                    match result {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            last_err = Some(e);
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        }
                    }
                }
                Err(last_err.unwrap_or(sqlx::Error::PoolClosed))
            };

            let finalized = matches!(
                tokio::time::timeout(DETACHED_TIMEOUT, finalize).await,
                Ok(Ok(()))
            );
            if !finalized {
                // A stuck in_progress row would wedge retries behind a 409
                // until the TTL passes; clearing lets the next retry start
                // fresh, trading a possible duplicate execution instead.
                error!(
                    endpoint = %self.endpoint,
                    "idempotency finalize failed; clearing reservation"
                );
                clear_record(
                    &self.pool,
                    self.org_id,
                    &self.agent_id,
                    &self.endpoint,
                    &self.key,
                )
                .await;
            }
        });
    }

    pub fn abandon(self) {
        tokio::spawn(async move {
            clear_record(
                &self.pool,
                self.org_id,
                &self.agent_id,
                &self.endpoint,
                &self.key,
            )
            .await;
        });
    }
}

async fn clear_record(pool: &PgPool, org_id: Uuid, agent_id: &str, endpoint: &str, key: &str) {
    let clear = async {
        for delay_ms in RETRY_DELAYS_MS {
            let result = sqlx::query(
                r#"
                DELETE FROM idempotency_keys
                WHERE org_id = $1 AND agent_id = $2 AND endpoint = $3 AND idem_key = $4
                "#,
            )
            .bind(org_id)
            .bind(agent_id)
            .bind(endpoint)
            .bind(key)
            .execute(pool)
            .await;
            if result.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        false
    };

    let cleared = matches!(tokio::time::timeout(DETACHED_TIMEOUT, clear).await, Ok(true));
    if !cleared {
        error!(endpoint, "failed to clear idempotency reservation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_key_order_and_whitespace() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{ "a": {"x": 3, "y": 2}, "b": 1 }"#).unwrap();
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn hash_distinguishes_different_payloads() {
        let a = serde_json::json!({"outcome": "JWT"});
        let b = serde_json::json!({"outcome": "OAuth"});
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = payload_hash(&serde_json::json!({}));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
