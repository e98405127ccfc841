use std::time::Duration;

use akashi_models::Relationship;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Everything the relationship classifier gets to see about a decision pair.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub agent_a: String,
    pub agent_b: String,
    pub decision_type_a: String,
    pub decision_type_b: String,
    pub outcome_a: String,
    pub outcome_b: String,
    pub timestamp_a: DateTime<Utc>,
    pub timestamp_b: DateTime<Utc>,
    pub session_a: Option<String>,
    pub session_b: Option<String>,
    pub reasoning_a: Option<String>,
    pub reasoning_b: Option<String>,
    pub topic_similarity: Option<f64>,
}

/// Parsed classifier output. Unknown categories and severities degrade to
/// empty strings; a missing relationship is a hard error.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorVerdict {
    pub relationship: Relationship,
    pub category: String,
    pub severity: String,
    pub explanation: String,
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("validator response unparseable: {0}")]
    Parse(String),

    #[error("validator provider error: {0}")]
    Provider(String),

    #[error("no validator configured")]
    Inactive,
}

/// The LLM relationship classifier capability. Variants: Ollama, OpenAI,
/// Noop, and a generated mock for tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    /// Whether a real model backs this validator. Inactive validators make
    /// the scorer skip stage 2 entirely.
    fn is_active(&self) -> bool;

    async fn validate(&self, ctx: &ValidationContext) -> Result<ValidatorVerdict, ValidatorError>;
}

/// Shared prompt for both HTTP providers.
pub fn build_prompt(ctx: &ValidationContext) -> String {
    let mut prompt = format!(
        "Two AI agents recorded decisions on the same topic. Classify the relationship \
         between decision A and decision B.\n\n\
         Decision A:\n  agent: {}\n  type: {}\n  outcome: {}\n  recorded_at: {}\n",
        ctx.agent_a,
        ctx.decision_type_a,
        ctx.outcome_a,
        ctx.timestamp_a.to_rfc3339(),
    );
    if let Some(session) = &ctx.session_a {
        prompt.push_str(&format!("  session: {}\n", session));
    }
    if let Some(reasoning) = &ctx.reasoning_a {
        prompt.push_str(&format!("  reasoning: {}\n", reasoning));
    }
    prompt.push_str(&format!(
        "\nDecision B:\n  agent: {}\n  type: {}\n  outcome: {}\n  recorded_at: {}\n",
        ctx.agent_b,
        ctx.decision_type_b,
        ctx.outcome_b,
        ctx.timestamp_b.to_rfc3339(),
    ));
    if let Some(session) = &ctx.session_b {
        prompt.push_str(&format!("  session: {}\n", session));
    }
    if let Some(reasoning) = &ctx.reasoning_b {
        prompt.push_str(&format!("  reasoning: {}\n", reasoning));
    }
    if let Some(similarity) = ctx.topic_similarity {
        prompt.push_str(&format!("\nTopic similarity: {:.3}\n", similarity));
    }
    prompt.push_str(
        "\nAnswer in exactly this format:\n\
         RELATIONSHIP: <contradiction|supersession|complementary|refinement|unrelated>\n\
         CATEGORY: <factual|assessment|strategic|temporal>\n\
         SEVERITY: <critical|high|medium|low>\n\
         EXPLANATION: <one or two sentences>\n",
    );
    prompt
}

/// Parse a classifier completion into a verdict.
///
/// Tolerates case differences, stray whitespace, markdown bold, bracketed
/// values, common truncations, and the legacy `VERDICT: yes|no` form.
pub fn parse_validator_response(text: &str) -> Result<ValidatorVerdict, ValidatorError> {
    let mut relationship: Option<Relationship> = None;
    let mut verdict: Option<Relationship> = None;
    let mut category = String::new();
    let mut severity = String::new();
    let mut explanation = String::new();

    for line in text.lines() {
        let line = line.replace("**", "");
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = unwrap_brackets(value.trim());

        if key.eq_ignore_ascii_case("relationship") {
            relationship = normalize_relationship(value);
        } else if key.eq_ignore_ascii_case("verdict") {
            verdict = match value.to_ascii_lowercase().as_str() {
                "yes" => Some(Relationship::Contradiction),
                "no" => Some(Relationship::Unrelated),
                _ => None,
            };
        } else if key.eq_ignore_ascii_case("category") {
            category = normalize_enum(value, &["factual", "assessment", "strategic", "temporal"]);
        } else if key.eq_ignore_ascii_case("severity") {
            severity = normalize_enum(value, &["critical", "high", "medium", "low"]);
        } else if key.eq_ignore_ascii_case("explanation") {
            explanation = value.to_string();
        }
    }

    // RELATIONSHIP wins over the legacy VERDICT when both are present.
    let relationship = relationship
        .or(verdict)
        .ok_or_else(|| ValidatorError::Parse("no RELATIONSHIP or VERDICT line".to_string()))?;

    Ok(ValidatorVerdict {
        relationship,
        category,
        severity,
        explanation,
    })
}

fn unwrap_brackets(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .map(str::trim)
        .unwrap_or(value)
}

fn normalize_relationship(value: &str) -> Option<Relationship> {
    let value = value.to_ascii_lowercase();
    let value = value.trim();
    // Prefix matching absorbs truncations like "refine" and "supersede".
    if value.starts_with("contradict") {
        Some(Relationship::Contradiction)
    } else if value.starts_with("superse") {
        Some(Relationship::Supersession)
    } else if value.starts_with("complement") {
        Some(Relationship::Complementary)
    } else if value.starts_with("refine") {
        Some(Relationship::Refinement)
    } else if value.starts_with("unrelated") {
        Some(Relationship::Unrelated)
    } else {
        None
    }
}

fn normalize_enum(value: &str, allowed: &[&str]) -> String {
    let lowered = value.to_ascii_lowercase();
    let lowered = lowered.trim();
    if allowed.contains(&lowered) {
        lowered.to_string()
    } else {
        String::new()
    }
}

/// Ollama `/api/generate` backend.
pub struct OllamaValidator {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaValidator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Validator for OllamaValidator {
    fn is_active(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &ValidationContext) -> Result<ValidatorVerdict, ValidatorError> {
        let prompt = build_prompt(ctx);
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&OllamaRequest {
                model: &self.model,
                prompt: &prompt,
                stream: false,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ValidatorError::Provider(format!(
                "ollama returned {}",
                resp.status()
            )));
        }

        let body: OllamaResponse = resp.json().await?;
        debug!(completion = %body.response, "validator completion");
        parse_validator_response(&body.response)
    }
}

/// OpenAI-compatible `/chat/completions` backend.
pub struct OpenAiValidator {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAiValidator {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Validator for OpenAiValidator {
    fn is_active(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &ValidationContext) -> Result<ValidatorVerdict, ValidatorError> {
        let prompt = build_prompt(ctx);
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: &prompt,
                }],
                temperature: 0.0,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ValidatorError::Provider(format!(
                "openai returned {}",
                resp.status()
            )));
        }

        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ValidatorError::Provider("empty choices".to_string()))?;
        parse_validator_response(content)
    }
}

/// Inert validator used when no LLM is configured. The scorer never runs
/// stage 2 against it, so no conflicts are persisted.
pub struct NoopValidator;

#[async_trait]
impl Validator for NoopValidator {
    fn is_active(&self) -> bool {
        false
    }

    async fn validate(&self, _ctx: &ValidationContext) -> Result<ValidatorVerdict, ValidatorError> {
        Err(ValidatorError::Inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ValidatorVerdict {
        parse_validator_response(text).unwrap()
    }

    #[test]
    fn parses_the_canonical_format() {
        let verdict = parse(
            "RELATIONSHIP: contradiction\n\
             CATEGORY: factual\n\
             SEVERITY: high\n\
             EXPLANATION: The outcomes are mutually exclusive.",
        );
        assert_eq!(verdict.relationship, Relationship::Contradiction);
        assert_eq!(verdict.category, "factual");
        assert_eq!(verdict.severity, "high");
        assert_eq!(verdict.explanation, "The outcomes are mutually exclusive.");
    }

    #[test]
    fn is_case_and_whitespace_insensitive() {
        let verdict = parse("  relationship :   SUPERSESSION  \n severity: LOW ");
        assert_eq!(verdict.relationship, Relationship::Supersession);
        assert_eq!(verdict.severity, "low");
    }

    #[test]
    fn strips_markdown_bold_and_brackets() {
        let verdict = parse(
            "**RELATIONSHIP**: **[contradiction]**\nCATEGORY: [assessment]\nSEVERITY: [medium]",
        );
        assert_eq!(verdict.relationship, Relationship::Contradiction);
        assert_eq!(verdict.category, "assessment");
        assert_eq!(verdict.severity, "medium");
    }

    #[test]
    fn normalizes_truncated_relationships() {
        assert_eq!(
            parse("RELATIONSHIP: refine").relationship,
            Relationship::Refinement
        );
        assert_eq!(
            parse("RELATIONSHIP: supersede").relationship,
            Relationship::Supersession
        );
        assert_eq!(
            parse("RELATIONSHIP: contradict").relationship,
            Relationship::Contradiction
        );
        assert_eq!(
            parse("RELATIONSHIP: complement").relationship,
            Relationship::Complementary
        );
    }

    #[test]
    fn legacy_verdict_maps_yes_and_no() {
        assert_eq!(
            parse("VERDICT: yes").relationship,
            Relationship::Contradiction
        );
        assert_eq!(parse("VERDICT: no").relationship, Relationship::Unrelated);
    }

    #[test]
    fn relationship_wins_over_verdict() {
        let verdict = parse("VERDICT: yes\nRELATIONSHIP: unrelated");
        assert_eq!(verdict.relationship, Relationship::Unrelated);
    }

    #[test]
    fn unknown_category_and_severity_become_empty() {
        let verdict = parse("RELATIONSHIP: contradiction\nCATEGORY: vibes\nSEVERITY: extreme");
        assert_eq!(verdict.category, "");
        assert_eq!(verdict.severity, "");
    }

    #[test]
    fn missing_relationship_is_an_error() {
        assert!(parse_validator_response("CATEGORY: factual\nSEVERITY: low").is_err());
        assert!(parse_validator_response("complete nonsense").is_err());
    }

    #[test]
    fn parsing_is_idempotent_over_noise() {
        let noisy = "**relationship**:  [Contradiction]\nCATEGORY:  FACTUAL\n";
        let clean = "RELATIONSHIP: contradiction\nCATEGORY: factual\n";
        assert_eq!(parse(noisy), parse(clean));
    }
}
