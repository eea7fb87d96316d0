use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Longest delay the backoff helper will ever return.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// The fixed set of failure codes this gateway produces. Every code maps to
/// exactly one severity, category and retryability; call sites never choose
/// those per-error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaValidation,
    ServiceUnavailable,
    CompositionFailed,
    QueryPlanningFailed,
    ExecutionTimeout,
    RateLimitExceeded,
    AuthenticationFailed,
    AuthorizationFailed,
    Internal,
    Configuration,
    Network,
    DataIntegrity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Validation,
    Network,
    Authentication,
    Authorization,
    Configuration,
    Execution,
    System,
}

impl ErrorCode {
    pub fn severity(self) -> Severity {
        match self {
            ErrorCode::SchemaValidation => Severity::Medium,
            ErrorCode::ServiceUnavailable => Severity::High,
            ErrorCode::CompositionFailed => Severity::High,
            ErrorCode::QueryPlanningFailed => Severity::Medium,
            ErrorCode::ExecutionTimeout => Severity::High,
            ErrorCode::RateLimitExceeded => Severity::Medium,
            ErrorCode::AuthenticationFailed => Severity::High,
            ErrorCode::AuthorizationFailed => Severity::High,
            ErrorCode::Internal => Severity::Critical,
            ErrorCode::Configuration => Severity::High,
            ErrorCode::Network => Severity::Medium,
            ErrorCode::DataIntegrity => Severity::Critical,
        }
    }

    pub fn category(self) -> Category {
        match self {
            ErrorCode::SchemaValidation => Category::Validation,
            ErrorCode::ServiceUnavailable => Category::Network,
            ErrorCode::CompositionFailed => Category::Execution,
            ErrorCode::QueryPlanningFailed => Category::Execution,
            ErrorCode::ExecutionTimeout => Category::Network,
            ErrorCode::RateLimitExceeded => Category::Execution,
            ErrorCode::AuthenticationFailed => Category::Authentication,
            ErrorCode::AuthorizationFailed => Category::Authorization,
            ErrorCode::Internal => Category::System,
            ErrorCode::Configuration => Category::Configuration,
            ErrorCode::Network => Category::Network,
            ErrorCode::DataIntegrity => Category::System,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ServiceUnavailable
                | ErrorCode::ExecutionTimeout
                | ErrorCode::RateLimitExceeded
                | ErrorCode::Network
        )
    }

    /// Wire representation used in `extensions.code`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SchemaValidation => "SCHEMA_VALIDATION",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::CompositionFailed => "COMPOSITION_FAILED",
            ErrorCode::QueryPlanningFailed => "QUERY_PLANNING_FAILED",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::AuthorizationFailed => "AUTHORIZATION_FAILED",
            ErrorCode::Internal => "INTERNAL_ERROR",
            ErrorCode::Configuration => "CONFIGURATION_ERROR",
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::DataIntegrity => "DATA_INTEGRITY_ERROR",
        }
    }
}

/// Structured gateway error. Severity, category and retryability are always
/// derived from the code, never set ad hoc.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{}: {message}", code.as_str())]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    pub service: Option<String>,
    pub operation: Option<String>,
    pub details: HashMap<String, String>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayError {
            code,
            message: message.into(),
            service: None,
            operation: None,
            details: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn category(&self) -> Category {
        self.code.category()
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// Routes the error to the log level matching its severity. Logging never
    /// changes control flow.
    pub fn log(&self) {
        let service = self.service.as_deref().unwrap_or("-");
        let operation = self.operation.as_deref().unwrap_or("-");
        match self.severity() {
            Severity::Critical | Severity::High => {
                tracing::error!(code = self.code.as_str(), service, operation, "{}", self.message)
            }
            Severity::Medium => {
                tracing::warn!(code = self.code.as_str(), service, operation, "{}", self.message)
            }
            Severity::Low => {
                tracing::info!(code = self.code.as_str(), service, operation, "{}", self.message)
            }
            Severity::Info => {
                tracing::debug!(code = self.code.as_str(), service, operation, "{}", self.message)
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at [`MAX_RETRY_DELAY`].
/// Callers are responsible for consulting `retryable()` first.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_map_to_fixed_attributes() {
        assert_eq!(ErrorCode::SchemaValidation.category(), Category::Validation);
        assert!(!ErrorCode::SchemaValidation.retryable());
        assert_eq!(ErrorCode::ServiceUnavailable.category(), Category::Network);
        assert!(ErrorCode::ServiceUnavailable.retryable());
        assert_eq!(ErrorCode::AuthenticationFailed.category(), Category::Authentication);
        assert!(!ErrorCode::AuthenticationFailed.retryable());
        assert_eq!(ErrorCode::Internal.severity(), Severity::Critical);
        assert!(!ErrorCode::Internal.retryable());
    }

    #[test]
    fn error_derives_attributes_from_code() {
        let err = GatewayError::new(ErrorCode::ExecutionTimeout, "upstream took too long")
            .with_service("catalog")
            .with_operation("execute_query");
        assert_eq!(err.severity(), Severity::High);
        assert_eq!(err.category(), Category::Network);
        assert!(err.retryable());
        assert_eq!(err.to_string(), "EXECUTION_TIMEOUT: upstream took too long");
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(0, base), Duration::from_secs(1));
        assert_eq!(retry_delay(1, base), Duration::from_secs(2));
        assert_eq!(retry_delay(3, base), Duration::from_secs(8));
    }

    #[test]
    fn retry_delay_caps_at_thirty_seconds() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(10, base), Duration::from_secs(30));
        assert_eq!(retry_delay(64, base), Duration::from_secs(30));
    }
}
