use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueryError, Result};

/// Identifies one in-flight operation: what is being run and with which arguments.
///
/// Tokens are immutable. A retry builds a new token, so the `id` names one
/// logical attempt rather than the statement text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionToken {
    id: Uuid,
    operation: String,
    parameters: Vec<serde_json::Value>,
    label: Option<String>,
}

impl ExecutionToken {
    /// Create a token for an operation descriptor (SQL text, procedure name, ...)
    pub fn new(operation: impl Into<String>, parameters: Vec<serde_json::Value>) -> Result<Self> {
        let operation = operation.into();
        if operation.trim().is_empty() {
            return Err(QueryError::invalid_argument(
                "operation descriptor is null or empty",
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            operation,
            parameters,
            label: None,
        })
    }

    /// Attach a human-readable label, typically the fluent entry point that built the token
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn parameters(&self) -> &[serde_json::Value] {
        &self.parameters
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl fmt::Display for ExecutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} [{}]", label, self.id),
            None => write!(f, "{} [{}]", self.operation, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_rejects_empty_operation() {
        let err = ExecutionToken::new("   ", vec![]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn test_retry_builds_distinct_token() {
        let first = ExecutionToken::new("SELECT 1", vec![json!(1)]).unwrap();
        let retry = ExecutionToken::new("SELECT 1", vec![json!(1)]).unwrap();
        assert_ne!(first.id(), retry.id());
        assert_eq!(first.operation(), retry.operation());
    }

    #[test]
    fn test_display_prefers_label() {
        let token = ExecutionToken::new("SELECT * FROM users", vec![])
            .unwrap()
            .with_label("from(users)");
        assert!(token.to_string().starts_with("from(users) ["));
        assert_eq!(token.label(), Some("from(users)"));
    }

    #[test]
    fn test_token_serializes_with_its_id() {
        let token = ExecutionToken::new("SELECT ?", vec![json!(7)])
            .unwrap()
            .with_label("sql");

        let encoded = serde_json::to_value(&token).unwrap();
        assert_eq!(encoded["id"], json!(token.id().to_string()));
        assert_eq!(encoded["parameters"], json!([7]));

        let decoded: ExecutionToken = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, token);
    }
}
