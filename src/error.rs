//! Error taxonomy for the gateway.
//!
//! Mirrors `microsandbox_wrapper/exceptions.py`: each variant carries the
//! context needed to reconstruct the original's `{error_code, message,
//! category, severity, recovery_suggestions, context}` shape for callers
//! that want it (`to_error_info`), while still composing with `?` and
//! `thiserror::Error` the way idiomatic Rust error types do.

use serde::Serialize;

/// Broad error classification, mirrors `exceptions.py::ErrorCategory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Configuration,
    Resource,
    Network,
    Execution,
    Session,
    System,
}

/// Error severity, mirrors `exceptions.py::ErrorSeverity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Subtype of a code-execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionErrorKind {
    Compilation,
    Runtime,
    Timeout,
}

/// Which resource axis a `ResourceLimit` error was raised against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Sessions,
    Memory,
}

/// The gateway's error type. One variant per category in spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("connection error: {message}")]
    Connection {
        message: String,
        server_url: Option<String>,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("failed to create {template} sandbox ({flavor}): {message}")]
    SandboxCreation {
        template: String,
        flavor: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("code execution failed ({kind:?}) in session {session_id}: {message}")]
    CodeExecution {
        kind: ExecutionErrorKind,
        session_id: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("command execution failed in session {session_id}: {message}")]
    CommandExecution {
        session_id: String,
        command: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("{resource_type:?} limit exceeded: {current} >= {limit}")]
    ResourceLimit {
        resource_type: ResourceKind,
        current: String,
        limit: String,
    },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Network,
            Self::SandboxCreation { .. } => ErrorCategory::Session,
            Self::CodeExecution { .. } | Self::CommandExecution { .. } => ErrorCategory::Execution,
            Self::ResourceLimit { .. } => ErrorCategory::Resource,
            Self::SessionNotFound { .. } => ErrorCategory::Session,
        }
    }

    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration { .. } => ErrorSeverity::Critical,
            Self::Connection { .. } => ErrorSeverity::High,
            Self::SandboxCreation { .. } => ErrorSeverity::High,
            Self::CodeExecution { .. } | Self::CommandExecution { .. } => ErrorSeverity::Medium,
            Self::ResourceLimit { .. } => ErrorSeverity::Medium,
            Self::SessionNotFound { .. } => ErrorSeverity::Low,
        }
    }

    /// Recovery suggestions, mirroring the per-category lists in
    /// `exceptions.py` (connection errors get network-troubleshooting
    /// suggestions, resource errors get scaling suggestions, and so on).
    #[must_use]
    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            Self::Configuration { .. } => vec![
                "Check the MSB_* environment variables for typos or invalid values".into(),
            ],
            Self::Connection { message, .. } => {
                let mut suggestions = vec![
                    "Check if the microsandbox server is running".into(),
                    "Verify the server URL is correct and accessible".into(),
                    "Check network connectivity and firewall settings".into(),
                    "Try again after a short delay (network issues may be transient)".into(),
                ];
                let lower = message.to_lowercase();
                if lower.contains("timeout") {
                    suggestions.push("Increase the connection timeout if the server is slow to respond".into());
                }
                if lower.contains("auth") {
                    suggestions.push("Check that the API key is set correctly".into());
                }
                suggestions
            }
            Self::SandboxCreation { .. } => vec![
                "Verify the requested template is supported (python, node)".into(),
                "Check that the remote server has capacity for the requested flavor".into(),
            ],
            Self::CodeExecution { kind, .. } => match kind {
                ExecutionErrorKind::Compilation => {
                    vec!["Check the submitted code for syntax errors".into()]
                }
                ExecutionErrorKind::Runtime => {
                    vec!["Inspect stderr for the underlying exception".into()]
                }
                ExecutionErrorKind::Timeout => vec![
                    "Increase the execution timeout for long-running code".into(),
                    "Break the work into smaller calls against the same session".into(),
                ],
            },
            Self::CommandExecution { .. } => {
                vec!["Inspect stderr and the exit code for the underlying failure".into()]
            }
            Self::ResourceLimit { resource_type, .. } => match resource_type {
                ResourceKind::Sessions => vec![
                    "Increase max_concurrent_sessions".into(),
                    "Enable LRU eviction".into(),
                    "Stop idle sessions explicitly".into(),
                ],
                ResourceKind::Memory => vec![
                    "Increase max_total_memory_mb".into(),
                    "Request a smaller flavor".into(),
                ],
            },
            Self::SessionNotFound { .. } => {
                vec!["Check the session_id for typos, or omit it to start a new session".into()]
            }
        }
    }

    /// Serializable, user-facing shape: `{error_code, message, category,
    /// severity, recovery_suggestions, context}`, matching
    /// `MicrosandboxWrapperError.to_dict`.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            error_code: self.error_code(),
            message: self.to_string(),
            category: self.category(),
            severity: self.severity(),
            recovery_suggestions: self.recovery_suggestions(),
            context: self.context(),
        }
    }

    fn error_code(&self) -> String {
        let name = match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::SandboxCreation { .. } => "SANDBOX_CREATION_ERROR",
            Self::CodeExecution { .. } => "CODE_EXECUTION_ERROR",
            Self::CommandExecution { .. } => "COMMAND_EXECUTION_ERROR",
            Self::ResourceLimit { .. } => "RESOURCE_LIMIT_ERROR",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
        };
        name.to_string()
    }

    fn context(&self) -> std::collections::HashMap<String, String> {
        let mut ctx = std::collections::HashMap::new();
        match self {
            Self::Connection { server_url, .. } => {
                if let Some(url) = server_url {
                    ctx.insert("server_url".into(), url.clone());
                }
            }
            Self::SandboxCreation { template, flavor, .. } => {
                ctx.insert("template".into(), template.clone());
                ctx.insert("flavor".into(), flavor.clone());
            }
            Self::CodeExecution { session_id, kind, .. } => {
                ctx.insert("session_id".into(), session_id.clone());
                ctx.insert("error_type".into(), format!("{kind:?}").to_lowercase());
            }
            Self::CommandExecution { session_id, command, .. } => {
                ctx.insert("session_id".into(), session_id.clone());
                ctx.insert("command".into(), command.clone());
            }
            Self::ResourceLimit { resource_type, current, limit } => {
                ctx.insert("resource_type".into(), format!("{resource_type:?}").to_lowercase());
                ctx.insert("current".into(), current.clone());
                ctx.insert("limit".into(), limit.clone());
            }
            Self::SessionNotFound { session_id } => {
                ctx.insert("session_id".into(), session_id.clone());
            }
            Self::Configuration { .. } => {}
        }
        ctx
    }

    /// Classify a lower-level connection failure by keyword, mirroring
    /// `exceptions.py::create_connection_error`.
    #[must_use]
    pub fn connection(server_url: &str, source: anyhow::Error) -> Self {
        let lower = source.to_string().to_lowercase();
        let message = if lower.contains("timeout") {
            format!("connection to {server_url} timed out")
        } else if lower.contains("refused") {
            format!("connection to {server_url} was refused - server may not be running")
        } else if lower.contains("unreachable") {
            format!("server at {server_url} is unreachable")
        } else {
            format!("failed to connect to {server_url}: {source}")
        };
        Self::Connection {
            message,
            server_url: Some(server_url.to_string()),
            source: Some(source),
        }
    }
}

/// Serializable, user-facing error representation.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub error_code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recovery_suggestions: Vec<String>,
    pub context: std::collections::HashMap<String, String>,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_classifies_by_keyword() {
        let err = GatewayError::connection("http://x", anyhow::anyhow!("Connection refused"));
        assert!(err.to_string().contains("refused"));
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn resource_limit_error_info_roundtrip() {
        let err = GatewayError::ResourceLimit {
            resource_type: ResourceKind::Sessions,
            current: "10".into(),
            limit: "10".into(),
        };
        let info = err.to_error_info();
        assert_eq!(info.error_code, "RESOURCE_LIMIT_ERROR");
        assert_eq!(info.context.get("resource_type").unwrap(), "sessions");
    }
}
