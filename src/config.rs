//! Gateway configuration, loaded from `MSB_*` environment variables.
//!
//! Mirrors `microsandbox_wrapper/config.py::WrapperConfig.from_env`: explicit
//! `std::env::var` reads, typed parsing, and validation of cross-field
//! invariants (cleanup interval vs. session timeout, memory cap vs. default
//! flavor). Kept as plain env parsing rather than a config-file crate,
//! matching both the teacher (`Config::from_env` reading `NIX_SANDBOX_METADATA`)
//! and the original Python wrapper.

use std::time::Duration;

use crate::error::GatewayError;
use crate::models::{Flavor, VolumeMapping};

/// Gateway configuration. Durations are pre-converted to `std::time::Duration`
/// so downstream code never juggles raw seconds.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server_url: String,
    pub api_key: Option<String>,

    pub session_timeout: Duration,
    pub max_concurrent_sessions: usize,
    pub cleanup_interval: Duration,

    pub default_flavor: Flavor,
    pub sandbox_start_timeout: Duration,
    pub default_execution_timeout: Duration,

    pub max_total_memory_mb: Option<u64>,
    pub shared_volume_mappings: Vec<VolumeMapping>,

    pub orphan_cleanup_interval: Duration,
    pub enable_lru_eviction: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5555".to_string(),
            api_key: None,
            session_timeout: Duration::from_secs(1800),
            max_concurrent_sessions: 10,
            cleanup_interval: Duration::from_secs(60),
            default_flavor: Flavor::Small,
            sandbox_start_timeout: Duration::from_secs_f64(180.0),
            default_execution_timeout: Duration::from_secs(300),
            max_total_memory_mb: None,
            shared_volume_mappings: Vec::new(),
            orphan_cleanup_interval: Duration::from_secs(600),
            enable_lru_eviction: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `MSB_*` environment variables, applying
    /// defaults for anything unset and validating the complete result.
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` if any value fails to parse or
    /// the validated whole is inconsistent (e.g. `cleanup_interval >=
    /// session_timeout`).
    pub fn from_env() -> Result<Self, GatewayError> {
        let defaults = Self::default();

        let server_url = std::env::var("MSB_SERVER_URL").unwrap_or(defaults.server_url.clone());
        let api_key = std::env::var("MSB_API_KEY").ok();

        let session_timeout = Duration::from_secs(parse_positive_u64(
            "MSB_SESSION_TIMEOUT",
            defaults.session_timeout.as_secs(),
        )?);
        let max_concurrent_sessions = parse_positive_u64(
            "MSB_MAX_SESSIONS",
            defaults.max_concurrent_sessions as u64,
        )? as usize;
        let cleanup_interval = Duration::from_secs(parse_positive_u64(
            "MSB_CLEANUP_INTERVAL",
            defaults.cleanup_interval.as_secs(),
        )?);
        let sandbox_start_timeout = Duration::from_secs_f64(parse_positive_f64(
            "MSB_SANDBOX_START_TIMEOUT",
            defaults.sandbox_start_timeout.as_secs_f64(),
        )?);
        let default_execution_timeout = Duration::from_secs(parse_positive_u64(
            "MSB_EXECUTION_TIMEOUT",
            defaults.default_execution_timeout.as_secs(),
        )?);
        let orphan_cleanup_interval = Duration::from_secs(parse_positive_u64(
            "MSB_ORPHAN_CLEANUP_INTERVAL",
            defaults.orphan_cleanup_interval.as_secs(),
        )?);

        let default_flavor = match std::env::var("MSB_DEFAULT_FLAVOR") {
            Ok(v) => v
                .trim()
                .to_lowercase()
                .parse()
                .map_err(|e| GatewayError::Configuration {
                    message: format!("invalid MSB_DEFAULT_FLAVOR: {e}"),
                })?,
            Err(_) => defaults.default_flavor,
        };

        let max_total_memory_mb = match std::env::var("MSB_MAX_TOTAL_MEMORY_MB") {
            Ok(v) if !v.trim().is_empty() => {
                let value: u64 = v.trim().parse().map_err(|_| GatewayError::Configuration {
                    message: format!("MSB_MAX_TOTAL_MEMORY_MB must be a valid integer, got '{v}'"),
                })?;
                if value == 0 {
                    return Err(GatewayError::Configuration {
                        message: format!("MSB_MAX_TOTAL_MEMORY_MB must be a positive integer, got {value}"),
                    });
                }
                Some(value)
            }
            _ => None,
        };

        let enable_lru_eviction = match std::env::var("MSB_ENABLE_LRU_EVICTION") {
            Ok(v) => parse_bool("MSB_ENABLE_LRU_EVICTION", &v)?,
            Err(_) => defaults.enable_lru_eviction,
        };

        let shared_volume_mappings = parse_volume_mappings()?;

        let config = Self {
            server_url,
            api_key,
            session_timeout,
            max_concurrent_sessions,
            cleanup_interval,
            default_flavor,
            sandbox_start_timeout,
            default_execution_timeout,
            max_total_memory_mb,
            shared_volume_mappings,
            orphan_cleanup_interval,
            enable_lru_eviction,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(GatewayError::Configuration {
                message: format!(
                    "invalid server URL format: {}. Must start with http:// or https://",
                    self.server_url
                ),
            });
        }

        if self.cleanup_interval >= self.session_timeout {
            return Err(GatewayError::Configuration {
                message: format!(
                    "cleanup interval ({}s) must be less than session timeout ({}s)",
                    self.cleanup_interval.as_secs(),
                    self.session_timeout.as_secs()
                ),
            });
        }

        if let Some(max_memory) = self.max_total_memory_mb {
            let min_needed = self.default_flavor.memory_mb();
            if max_memory < min_needed {
                return Err(GatewayError::Configuration {
                    message: format!(
                        "max total memory ({max_memory}MB) is less than minimum needed for default flavor ({min_needed}MB)"
                    ),
                });
            }
        }

        if self.max_concurrent_sessions < 1 {
            return Err(GatewayError::Configuration {
                message: "max concurrent sessions must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_positive_u64(env_var: &str, default: u64) -> Result<u64, GatewayError> {
    match std::env::var(env_var) {
        Err(_) => Ok(default),
        Ok(v) => {
            let value: u64 = v.trim().parse().map_err(|_| GatewayError::Configuration {
                message: format!("{env_var} must be a valid integer, got '{v}'"),
            })?;
            if value == 0 {
                return Err(GatewayError::Configuration {
                    message: format!("{env_var} must be a positive integer, got {value}"),
                });
            }
            Ok(value)
        }
    }
}

fn parse_positive_f64(env_var: &str, default: f64) -> Result<f64, GatewayError> {
    match std::env::var(env_var) {
        Err(_) => Ok(default),
        Ok(v) => {
            let value: f64 = v.trim().parse().map_err(|_| GatewayError::Configuration {
                message: format!("{env_var} must be a valid number, got '{v}'"),
            })?;
            if value <= 0.0 {
                return Err(GatewayError::Configuration {
                    message: format!("{env_var} must be a positive number, got {value}"),
                });
            }
            Ok(value)
        }
    }
}

fn parse_bool(env_var: &str, raw: &str) -> Result<bool, GatewayError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GatewayError::Configuration {
            message: format!("{env_var} must be a boolean, got '{other}'"),
        }),
    }
}

/// Parse `MSB_SHARED_VOLUME_PATH`, supporting both a JSON array and a
/// comma-separated list, matching
/// `config.py::WrapperConfig._parse_shared_volume_mappings`.
fn parse_volume_mappings() -> Result<Vec<VolumeMapping>, GatewayError> {
    let raw = match std::env::var("MSB_SHARED_VOLUME_PATH") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return Ok(Vec::new()),
    };
    let trimmed = raw.trim();

    let candidates: Vec<String> = if trimmed.starts_with('[') && trimmed.ends_with(']') {
        serde_json::from_str(trimmed).map_err(|e| GatewayError::Configuration {
            message: format!("invalid JSON format in MSB_SHARED_VOLUME_PATH: {e}"),
        })?
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };

    candidates
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| {
            VolumeMapping::parse(&s).map_err(|e| GatewayError::Configuration {
                message: format!("invalid volume mapping in MSB_SHARED_VOLUME_PATH: {e}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "MSB_SERVER_URL",
            "MSB_API_KEY",
            "MSB_SESSION_TIMEOUT",
            "MSB_MAX_SESSIONS",
            "MSB_CLEANUP_INTERVAL",
            "MSB_DEFAULT_FLAVOR",
            "MSB_SANDBOX_START_TIMEOUT",
            "MSB_EXECUTION_TIMEOUT",
            "MSB_MAX_TOTAL_MEMORY_MB",
            "MSB_SHARED_VOLUME_PATH",
            "MSB_ORPHAN_CLEANUP_INTERVAL",
            "MSB_ENABLE_LRU_EVICTION",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.server_url, "http://127.0.0.1:5555");
        assert_eq!(config.max_concurrent_sessions, 10);
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert!(config.enable_lru_eviction);
    }

    #[test]
    fn rejects_cleanup_interval_ge_session_timeout() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MSB_SESSION_TIMEOUT", "60");
        std::env::set_var("MSB_CLEANUP_INTERVAL", "60");
        let result = GatewayConfig::from_env();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn parses_comma_separated_volume_mappings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MSB_SHARED_VOLUME_PATH", "/host1:/c1, /host2:/c2");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.shared_volume_mappings.len(), 2);
        assert_eq!(config.shared_volume_mappings[0].host_path, "/host1");
        clear_env();
    }

    #[test]
    fn parses_json_array_volume_mappings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MSB_SHARED_VOLUME_PATH", r#"["/host1:/c1","/host2:/c2"]"#);
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.shared_volume_mappings.len(), 2);
        clear_env();
    }

    #[test]
    fn rejects_memory_cap_below_default_flavor() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MSB_DEFAULT_FLAVOR", "large");
        std::env::set_var("MSB_MAX_TOTAL_MEMORY_MB", "1024");
        let result = GatewayConfig::from_env();
        assert!(result.is_err());
        clear_env();
    }
}
