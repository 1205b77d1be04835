//! Data model shared across the session manager, resource manager, and gateway.
//!
//! Mirrors `microsandbox_wrapper/models.py` from the original Python wrapper:
//! closed enums for flavor/status, plus the result/info/stats structs handed
//! back across the public API.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Predefined sandbox resource configurations.
///
/// Each flavor maps to a fixed `(memory_mb, cpus)` pair, used both for
/// admission accounting and as a parameter to remote sandbox start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Small,
    Medium,
    Large,
}

impl Flavor {
    /// Memory limit in megabytes for this flavor.
    #[must_use]
    pub const fn memory_mb(self) -> u64 {
        match self {
            Self::Small => 1024,
            Self::Medium => 2048,
            Self::Large => 4096,
        }
    }

    /// CPU core allocation for this flavor.
    #[must_use]
    pub const fn cpus(self) -> f64 {
        match self {
            Self::Small => 1.0,
            Self::Medium => 2.0,
            Self::Large => 4.0,
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Flavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(format!(
                "invalid flavor '{other}'. Valid options are: small, medium, large"
            )),
        }
    }
}

/// Sandbox runtime template. A closed variant over the two interpreters the
/// remote server supports; parsed once at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Python,
    Node,
}

impl Template {
    /// Parse a free-form template string, normalizing case and applying the
    /// `node`/`nodejs`/`javascript` aliasing rule.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.to_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "node" | "nodejs" | "javascript" => Ok(Self::Node),
            other => Err(format!("unsupported template: '{other}'")),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Python => "python",
            Self::Node => "node",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a `ManagedSession`.
///
/// `CREATING` and `PROCESSING` are protected: an LRU evictor must not touch
/// them. `RUNNING` is reserved for future use by the remote server's own
/// execution state and is never assigned by this crate's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Ready,
    Processing,
    Running,
    Error,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of code execution within a sandbox session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub execution_time_ms: u64,
    pub session_created: bool,
    pub template: Template,
}

/// Result of command execution within a sandbox session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub execution_time_ms: u64,
    pub session_created: bool,
    pub command: String,
    pub args: Vec<String>,
}

/// Immutable snapshot of a session's state, handed to callers instead of a
/// live reference (the registry exclusively owns the `ManagedSession`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub template: Template,
    pub flavor: Flavor,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub status: SessionStatus,
    pub namespace: String,
    pub sandbox_name: String,
}

/// Snapshot of resource usage across the registry, computed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions_by_flavor: std::collections::HashMap<Flavor, usize>,
    pub total_memory_mb: u64,
    pub total_cpus: f64,
    pub uptime_seconds: u64,
}

/// A `host_path:container_path` volume mapping, passed verbatim to the
/// remote server at sandbox start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
}

impl VolumeMapping {
    /// Parse a `host_path:container_path` string. Both sides must be
    /// non-empty.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (host, container) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid volume mapping format: {raw}. Expected 'host_path:container_path'"))?;
        let host_path = host.trim();
        let container_path = container.trim();
        if host_path.is_empty() || container_path.is_empty() {
            return Err(format!(
                "invalid volume mapping format: {raw}. Both paths must be non-empty"
            ));
        }
        Ok(Self {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
        })
    }
}

impl fmt::Display for VolumeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path, self.container_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn flavor_resources() {
        assert_eq!(Flavor::Small.memory_mb(), 1024);
        assert_eq!(Flavor::Medium.memory_mb(), 2048);
        assert_eq!(Flavor::Large.memory_mb(), 4096);
        assert!((Flavor::Large.cpus() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flavor_from_str_rejects_unknown() {
        assert!(Flavor::from_str("small").is_ok());
        assert!(Flavor::from_str("huge").is_err());
    }

    #[test]
    fn template_parse_aliases() {
        assert_eq!(Template::parse("NODE").unwrap(), Template::Node);
        assert_eq!(Template::parse("nodejs").unwrap(), Template::Node);
        assert_eq!(Template::parse("javascript").unwrap(), Template::Node);
        assert_eq!(Template::parse("Python").unwrap(), Template::Python);
        assert!(Template::parse("ruby").is_err());
    }

    #[test]
    fn volume_mapping_parse() {
        let m = VolumeMapping::parse(" /host : /container ").unwrap();
        assert_eq!(m.host_path, "/host");
        assert_eq!(m.container_path, "/container");
        assert_eq!(m.to_string(), "/host:/container");

        assert!(VolumeMapping::parse("no-colon").is_err());
        assert!(VolumeMapping::parse(":/container").is_err());
        assert!(VolumeMapping::parse("/host:").is_err());
    }
}
