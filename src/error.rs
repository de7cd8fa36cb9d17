//! Crate-level error type
//!
//! Each layer keeps its own `thiserror` enum; [`CoreError`] wraps them so the
//! host sees one type. Messages pass through [`CoreError::sanitized_message`]
//! before they leave the process.

use crate::broker::{BrokerError, PublishError, SubscriptionError};
use crate::config::ConfigError;
use crate::consumer::ConsumerError;
use crate::link::{ApiError, LinkError};
use crate::protocol::DecodeError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATED_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token)\s*[=:]\s*\S+").ok());

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl CoreError {
    /// Warn-class errors are reported without affecting the connection
    pub fn is_warning(&self) -> bool {
        match self {
            CoreError::Publish(e) => e.is_warning(),
            CoreError::Consumer(e) => e.is_warning(),
            CoreError::Broker(e) => e.is_warning(),
            _ => false,
        }
    }

    /// Display text with secrets redacted, at most 500 bytes
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result alias for crate-level operations
pub type CoreResult<T> = Result<T, CoreError>;

fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = match SECRET_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(message, "${1}=***").into_owned(),
        None => message.to_string(),
    };

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATED_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATED_SUFFIX);
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let sanitized = sanitize_error_message("Auth failed: password=secret123 token: abc456");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_redaction_is_case_insensitive() {
        let sanitized = sanitize_error_message("PASSWORD=hunter2 Token=xyz");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert_eq!(sanitized.len(), MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED_SUFFIX));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
        assert!(!exact.contains("truncated"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED_SUFFIX));
    }

    #[test]
    fn test_publish_errors_are_warnings() {
        let error = CoreError::from(PublishError::InvalidTopicAlias(99));
        assert!(error.is_warning());
        assert_eq!(error.sanitized_message(), "Invalid topicAlias: 99");

        let error = CoreError::from(ConsumerError::Publish(PublishError::InvalidTopic(
            "a/+".to_string(),
        )));
        assert!(error.is_warning());

        let error = CoreError::from(ConfigError::EnvVarNotFound("TEAM_TOKEN".to_string()));
        assert!(!error.is_warning());
        assert_eq!(
            error.to_string(),
            "Configuration error: Environment variable not found: TEAM_TOKEN"
        );
    }
}
