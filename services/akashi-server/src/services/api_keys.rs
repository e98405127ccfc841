use std::sync::Arc;

use actix_web::web;
use akashi_common::AppError;
use akashi_models::Agent;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Argon2id parameters: t=1, m=64 MiB, p=4, 32-byte output. Salts are the
/// 16-byte `SaltString` default.
const MEMORY_KIB: u32 = 65536;
const ITERATIONS: u32 = 1;
const PARALLELISM: u32 = 4;
const OUTPUT_LEN: usize = 32;

/// Verifies `ApiKey agent_id:secret` credentials. Holds a precomputed dummy
/// hash so unknown agent ids still pay the full Argon2 cost, equalizing
/// response timing.
pub struct ApiKeyVerifier {
    argon2: Argon2<'static>,
    dummy_hash: String,
}

impl ApiKeyVerifier {
    pub fn new() -> Self {
        let params = Params::new(MEMORY_KIB, ITERATIONS, PARALLELISM, Some(OUTPUT_LEN))
            .expect("valid argon2 params");
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = argon2
            .hash_password(b"akashi-dummy-credential", &salt)
            .expect("hash dummy credential")
            .to_string();

        Self { argon2, dummy_hash }
    }

    /// Hash a freshly generated secret for storage.
    pub fn hash_secret(&self, secret: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("failed to hash api key: {}", e)))?;
        Ok(hash.to_string())
    }

    pub fn verify_secret(&self, secret: &str, stored_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return false;
        };
        self.argon2
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }

    /// Burn the same work as a real verification without revealing whether
    /// the agent id exists.
    pub fn dummy_verify(&self, secret: &str) {
        let _ = self.verify_secret(secret, &self.dummy_hash);
    }
}

impl Default for ApiKeyVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a new opaque API key secret.
pub fn generate_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Resolve and verify an API-key credential against the agents table.
/// Argon2 runs on the blocking pool; when no agent matches, a dummy
/// verification burns the same work so response timing stays flat.
pub async fn authenticate_api_key(
    verifier: &Arc<ApiKeyVerifier>,
    pool: &PgPool,
    agent_id: &str,
    secret: &str,
) -> Result<Agent, AppError> {
    let candidates: Vec<Agent> = sqlx::query_as(
        r#"
        SELECT id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at
        FROM agents
        WHERE agent_id = $1 AND api_key_hash IS NOT NULL
        "#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;

    let verifier = verifier.clone();
    let secret = secret.to_string();
    let matched = web::block(move || {
        if candidates.is_empty() {
            verifier.dummy_verify(&secret);
            return None;
        }
        candidates.into_iter().find(|agent| {
            agent
                .api_key_hash
                .as_deref()
                .map(|hash| verifier.verify_secret(&secret, hash))
                .unwrap_or(false)
        })
    })
    .await
    .map_err(|e| AppError::Internal(format!("credential check failed: {}", e)))?;

    matched.ok_or_else(|| AppError::Unauthorized("invalid credentials".to_string()))
}

/// Parse an `Authorization: ApiKey agent_id:secret` header value.
pub fn parse_api_key_header(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix("ApiKey ")?;
    let (agent_id, secret) = rest.split_once(':')?;
    if agent_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((agent_id, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let verifier = ApiKeyVerifier::new();
        let secret = generate_secret();
        let hash = verifier.hash_secret(&secret).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verifier.verify_secret(&secret, &hash));
        assert!(!verifier.verify_secret("wrong-secret", &hash));
    }

    #[test]
    fn hash_encodes_configured_parameters() {
        let verifier = ApiKeyVerifier::new();
        let hash = verifier.hash_secret("s3cr3t").unwrap();
        assert!(hash.contains("m=65536,t=1,p=4"));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        let verifier = ApiKeyVerifier::new();
        assert!(!verifier.verify_secret("anything", "not-a-phc-string"));
    }

    #[test]
    fn parses_api_key_credential_form() {
        assert_eq!(
            parse_api_key_header("ApiKey alice:secret-123"),
            Some(("alice", "secret-123"))
        );
        assert!(parse_api_key_header("Bearer token").is_none());
        assert!(parse_api_key_header("ApiKey no-colon").is_none());
        assert!(parse_api_key_header("ApiKey :secret").is_none());
        assert!(parse_api_key_header("ApiKey alice:").is_none());
    }

    #[test]
    fn generated_secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
        assert_eq!(generate_secret().len(), 64);
    }
}
