use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

/// Safe character class for agent ids. Colons are forbidden because the
/// `ApiKey agent_id:secret` credential form uses one as the separator.
static AGENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("valid agent id regex"));

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 1000;
pub const MAX_OFFSET: i64 = 100_000;

pub fn is_valid_agent_id(agent_id: &str) -> bool {
    AGENT_ID_RE.is_match(agent_id)
}

/// `validator`-compatible custom check for request structs.
pub fn validate_agent_id(agent_id: &str) -> std::result::Result<(), ValidationError> {
    if is_valid_agent_id(agent_id) {
        Ok(())
    } else {
        Err(ValidationError::new("agent_id"))
    }
}

/// Client-supplied request ids are honored only when short and printable.
pub fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

pub fn clamp_limit(requested: Option<i64>) -> i64 {
    match requested {
        Some(n) if n > 0 => n.min(MAX_LIMIT),
        _ => DEFAULT_LIMIT,
    }
}

pub fn clamp_offset(requested: Option<i64>) -> i64 {
    requested.unwrap_or(0).clamp(0, MAX_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_character_class() {
        assert!(is_valid_agent_id("alice"));
        assert!(is_valid_agent_id("agent-7.worker_2"));
        assert!(is_valid_agent_id("A1"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("alice:secret"));
        assert!(!is_valid_agent_id("-leading"));
        assert!(!is_valid_agent_id("space bar"));
        assert!(!is_valid_agent_id(&"a".repeat(65)));
    }

    #[test]
    fn request_id_charset_and_length() {
        assert!(is_valid_request_id("req-123"));
        assert!(is_valid_request_id(&"x".repeat(128)));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id(&"x".repeat(129)));
        assert!(!is_valid_request_id("bad\nnewline"));
        assert!(!is_valid_request_id("emoji-\u{1f600}"));
    }

    #[test]
    fn limits_clamp_to_bounds() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(-5)), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(5000)), MAX_LIMIT);
        assert_eq!(clamp_offset(None), 0);
        assert_eq!(clamp_offset(Some(-1)), 0);
        assert_eq!(clamp_offset(Some(200_000)), MAX_OFFSET);
    }
}
