use akashi_common::AppError;
use akashi_models::{Agent, Role};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::SigningKey;
use pkcs8::LineEnding;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const ISSUER: &str = "akashi";
pub const AUDIENCE: &str = "akashi";

/// The per-request principal. Carried through request extensions only, never
/// through globals. `sub` stays a string so a malformed subject in a foreign
/// token degrades to denied access instead of a hard failure downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub agent_id: String,
    pub org_id: Uuid,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoped_by: Option<String>,
    pub iss: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Caller's agent UUID, if the subject is well formed.
    pub fn subject_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn require(&self, min_role: Role) -> Result<(), AppError> {
        if self.role >= min_role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "requires {} role or above",
                min_role
            )))
        }
    }
}

/// Issues and validates EdDSA-signed bearer tokens. Key material is immutable
/// after construction.
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: i64,
    scoped_ttl_cap: i64,
}

impl JwtManager {
    pub fn new(
        private_pem: &[u8],
        public_pem: &[u8],
        token_ttl: i64,
        scoped_ttl_cap: i64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            encoding_key: EncodingKey::from_ed_pem(private_pem)?,
            decoding_key: DecodingKey::from_ed_pem(public_pem)?,
            token_ttl,
            scoped_ttl_cap,
        })
    }

    pub fn from_key_paths(
        private_path: Option<&str>,
        public_path: Option<&str>,
        token_ttl: i64,
        scoped_ttl_cap: i64,
    ) -> anyhow::Result<Self> {
        match (private_path, public_path) {
            (Some(private_path), Some(public_path)) => {
                let private_pem = std::fs::read(private_path)?;
                let public_pem = std::fs::read(public_path)?;
                Self::new(&private_pem, &public_pem, token_ttl, scoped_ttl_cap)
            }
            _ => {
                warn!(
                    "No Ed25519 key paths configured; generating an ephemeral pair. \
                     Tokens will not survive a restart."
                );
                Self::ephemeral(token_ttl, scoped_ttl_cap)
            }
        }
    }

    /// Generate a fresh in-memory Ed25519 pair.
    pub fn ephemeral(token_ttl: i64, scoped_ttl_cap: i64) -> anyhow::Result<Self> {
        let signing = SigningKey::generate(&mut OsRng);
        let private_pem = signing.to_pkcs8_pem(LineEnding::LF)?;
        let public_pem = signing.verifying_key().to_public_key_pem(LineEnding::LF)?;
        Self::new(
            private_pem.as_bytes(),
            public_pem.as_bytes(),
            token_ttl,
            scoped_ttl_cap,
        )
    }

    /// Issue a token for an authenticated agent.
    pub fn issue(&self, agent: &Agent) -> Result<(String, DateTime<Utc>), AppError> {
        self.issue_with(agent, None, Some(agent.id), self.token_ttl)
    }

    /// Mint a token acting as `target` on behalf of an admin. The TTL is
    /// capped regardless of the requested value and the admin is recorded in
    /// `scoped_by`.
    pub fn issue_scoped(
        &self,
        admin: &Claims,
        target: &Agent,
        requested_ttl: Option<i64>,
    ) -> Result<(String, DateTime<Utc>), AppError> {
        let ttl = requested_ttl
            .unwrap_or(self.scoped_ttl_cap)
            .clamp(1, self.scoped_ttl_cap);
        self.issue_with(target, Some(admin.agent_id.clone()), None, ttl)
    }

    fn issue_with(
        &self,
        agent: &Agent,
        scoped_by: Option<String>,
        api_key_id: Option<Uuid>,
        ttl: i64,
    ) -> Result<(String, DateTime<Utc>), AppError> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl);
        let claims = Claims {
            sub: agent.id.to_string(),
            agent_id: agent.agent_id.clone(),
            org_id: agent.org_id,
            role: agent.role(),
            api_key_id,
            scoped_by,
            iss: ISSUER.to_string(),
            aud: vec![AUDIENCE.to_string()],
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("failed to sign token: {}", e)))?;
        Ok((token, expires_at))
    }

    /// Validate signature, algorithm, issuer, audience, and expiry. Anything
    /// signed with a different algorithm is rejected outright.
    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AppError::Unauthorized("invalid token".to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(role: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            agent_id: "alice".to_string(),
            role: role.to_string(),
            api_key_hash: None,
            tags: vec![],
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn manager() -> JwtManager {
        JwtManager::ephemeral(3600, 3600).unwrap()
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let jwt = manager();
        let agent = test_agent("agent");
        let (token, expires_at) = jwt.issue(&agent).unwrap();
        let claims = jwt.verify(&token).unwrap();

        assert_eq!(claims.sub, agent.id.to_string());
        assert_eq!(claims.agent_id, "alice");
        assert_eq!(claims.role, Role::Agent);
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.exp, expires_at.timestamp());
        assert!(claims.scoped_by.is_none());
    }

    #[test]
    fn foreign_key_is_rejected() {
        let jwt = manager();
        let other = manager();
        let (token, _) = jwt.issue(&test_agent("agent")).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn non_eddsa_token_is_rejected() {
        let jwt = manager();
        // HS256-signed token with otherwise plausible claims.
        let claims = serde_json::json!({
            "sub": Uuid::new_v4().to_string(),
            "agent_id": "alice",
            "org_id": Uuid::nil(),
            "role": "admin",
            "iss": ISSUER,
            "aud": [AUDIENCE],
            "iat": Utc::now().timestamp(),
            "exp": Utc::now().timestamp() + 600,
        });
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"not-the-key"),
        )
        .unwrap();
        assert!(jwt.verify(&forged).is_err());
    }

    #[test]
    fn scoped_token_ttl_is_capped_and_records_admin() {
        let jwt = manager();
        let admin_agent = test_agent("admin");
        let (admin_token, _) = jwt.issue(&admin_agent).unwrap();
        let admin_claims = jwt.verify(&admin_token).unwrap();

        let target = Agent {
            agent_id: "bob".to_string(),
            ..test_agent("agent")
        };
        let (token, expires_at) = jwt
            .issue_scoped(&admin_claims, &target, Some(86_400))
            .unwrap();
        let claims = jwt.verify(&token).unwrap();

        assert_eq!(claims.agent_id, "bob");
        assert_eq!(claims.scoped_by.as_deref(), Some("alice"));
        assert!(expires_at <= Utc::now() + Duration::seconds(3601));
    }

    #[test]
    fn expired_token_is_rejected() {
        let jwt = JwtManager::ephemeral(-120, 3600).unwrap();
        let (token, _) = jwt.issue(&test_agent("agent")).unwrap();
        assert!(jwt.verify(&token).is_err());
    }

    #[test]
    fn role_requirement_is_rank_based() {
        let jwt = manager();
        let (token, _) = jwt.issue(&test_agent("org_owner")).unwrap();
        let claims = jwt.verify(&token).unwrap();
        assert!(claims.require(Role::Admin).is_ok());
        assert!(claims.require(Role::PlatformAdmin).is_err());
    }
}
