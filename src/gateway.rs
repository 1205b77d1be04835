//! The single public façade: binds `SessionManager` and `ResourceManager`,
//! forwards execute calls through admission control, and exposes the
//! query/maintenance surface.
//!
//! Grounded on `wrapper.py::MicrosandboxWrapper`: `start`/`stop`,
//! `execute_code`/`execute_command`, `get_sessions`/`stop_session`,
//! `get_resource_stats`, `cleanup_orphan_sandboxes`, plus the supplemented
//! `graceful_shutdown`/`pause_background_tasks`/`resume_background_tasks`/
//! `get_background_task_status` (see SPEC_FULL.md's "Supplemented features").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{CommandResult, ExecutionResult, Flavor, ResourceStats, SessionInfo, Template, VolumeMapping};
use crate::remote::{RemoteApi, RemoteClient};
use crate::resource::{OrphanCleanupStats, ResourceManager, SandboxClassification};
use crate::session::{SessionCleanupStats, SessionManager};

/// Status of `HealthCheck`'s component breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub session_manager: bool,
    pub resource_manager: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub components: ComponentHealth,
    pub uptime_seconds: u64,
}

/// Result of `graceful_shutdown`.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub session_manager_stopped: bool,
    pub resource_manager_stopped: bool,
    pub elapsed_ms: u64,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTaskStatus {
    pub session_reaper_healthy: bool,
    pub orphan_reaper_healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    pub session_reaper_restarted: bool,
    pub orphan_reaper_restarted: bool,
}

/// The gateway. One instance per process.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    remote: Arc<dyn RemoteApi>,
    session_manager: Arc<SessionManager>,
    resource_manager: Arc<ResourceManager>,
    started: AtomicBool,
    started_at: Instant,
}

impl Gateway {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let remote: Arc<dyn RemoteApi> = Arc::new(RemoteClient::new(config.server_url.clone(), config.api_key.clone()));
        Self::with_remote(config, remote)
    }

    /// Build a gateway over a caller-supplied `RemoteApi`, used by tests to
    /// substitute an in-process mock for the live HTTP client.
    #[must_use]
    pub fn with_remote(config: Arc<GatewayConfig>, remote: Arc<dyn RemoteApi>) -> Self {
        let session_manager = Arc::new(SessionManager::new(Arc::clone(&config), Arc::clone(&remote)));
        let resource_manager = Arc::new(ResourceManager::new(
            Arc::clone(&config),
            Arc::clone(&remote),
            Arc::clone(&session_manager),
        ));
        Self {
            config,
            remote,
            session_manager,
            resource_manager,
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Start both background reapers. Must be called before any other
    /// method; calls made beforehand fail with a configuration error.
    pub fn start(&self) {
        self.session_manager.start_reaper();
        self.resource_manager.start_orphan_reaper();
        self.started.store(true, Ordering::Release);
    }

    fn ensure_started(&self) -> Result<(), GatewayError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GatewayError::Configuration {
                message: "gateway has not been started".to_string(),
            })
        }
    }

    /// Simple unconditional stop: `ResourceManager` before `SessionManager`
    /// (see DESIGN.md's cyclic-shutdown-avoidance note).
    pub async fn stop(&self) {
        self.resource_manager.stop().await;
        self.session_manager.graceful_shutdown(Duration::from_secs(30)).await;
        self.started.store(false, Ordering::Release);
    }

    /// Richer, bounded-deadline shutdown returning a structured report.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        self.resource_manager.stop().await;
        let all_stopped = self.session_manager.graceful_shutdown(timeout).await;
        self.started.store(false, Ordering::Release);
        ShutdownReport {
            session_manager_stopped: all_stopped,
            resource_manager_stopped: true,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            forced: !all_stopped,
        }
    }

    fn parse_template(raw: Option<&str>) -> Result<Template, GatewayError> {
        let raw = raw.unwrap_or("python");
        Template::parse(raw).map_err(|message| GatewayError::SandboxCreation {
            template: raw.to_string(),
            flavor: String::new(),
            message,
            source: None,
        })
    }

    pub async fn execute_code(
        &self,
        code: &str,
        template: Option<&str>,
        session_id: Option<String>,
        flavor: Option<Flavor>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, GatewayError> {
        self.ensure_started()?;
        let template = Self::parse_template(template)?;
        let flavor = flavor.unwrap_or(self.config.default_flavor);
        let (session, created) = self
            .resource_manager
            .admit_and_get_or_create(session_id, template, flavor)
            .await?;
        let mut result = session
            .run_code(
                self.remote.as_ref(),
                code,
                timeout,
                self.config.default_execution_timeout,
                &self.config.shared_volume_mappings,
                self.config.sandbox_start_timeout,
            )
            .await?;
        result.session_created = created;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_command(
        &self,
        command: &str,
        args: &[String],
        template: Option<&str>,
        session_id: Option<String>,
        flavor: Option<Flavor>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, GatewayError> {
        self.ensure_started()?;
        let template = Self::parse_template(template)?;
        let flavor = flavor.unwrap_or(self.config.default_flavor);
        let (session, created) = self
            .resource_manager
            .admit_and_get_or_create(session_id, template, flavor)
            .await?;
        let mut result = session
            .run_command(
                self.remote.as_ref(),
                command,
                args,
                timeout,
                self.config.default_execution_timeout,
                &self.config.shared_volume_mappings,
                self.config.sandbox_start_timeout,
            )
            .await?;
        result.session_created = created;
        Ok(result)
    }

    pub async fn get_sessions(&self, session_id: Option<&str>) -> Vec<SessionInfo> {
        self.session_manager.get_sessions(session_id).await
    }

    pub async fn stop_session(&self, session_id: &str) -> bool {
        self.session_manager.stop(session_id).await
    }

    #[must_use]
    pub fn get_volume_mappings(&self) -> Vec<VolumeMapping> {
        self.config.shared_volume_mappings.clone()
    }

    pub async fn get_stats(&self) -> ResourceStats {
        self.resource_manager.get_resource_stats().await
    }

    pub async fn cleanup_orphans(&self) -> Result<usize, GatewayError> {
        self.resource_manager.reconcile_orphans_once().await
    }

    pub async fn get_running_sandboxes_info(&self) -> Result<Vec<SandboxClassification>, GatewayError> {
        self.resource_manager.get_running_sandboxes_info().await
    }

    pub fn get_orphan_cleanup_stats(&self) -> OrphanCleanupStats {
        self.resource_manager.get_orphan_cleanup_stats()
    }

    pub async fn get_session_cleanup_stats(&self) -> SessionCleanupStats {
        self.session_manager.get_cleanup_stats().await
    }

    pub async fn health_check(&self) -> HealthStatus {
        let session_ok = self.session_manager.is_reaper_healthy().await;
        let resource_ok = self.resource_manager.is_orphan_cleanup_healthy().await;
        HealthStatus {
            status: if session_ok && resource_ok { "healthy" } else { "degraded" }.to_string(),
            components: ComponentHealth {
                session_manager: session_ok,
                resource_manager: resource_ok,
            },
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn pause_background_tasks(&self) {
        self.session_manager.pause_reaper().await;
        self.resource_manager.pause_orphan_reaper().await;
    }

    pub async fn resume_background_tasks(&self) {
        self.session_manager.resume_reaper().await;
        self.resource_manager.resume_orphan_reaper().await;
    }

    pub async fn get_background_task_status(&self) -> BackgroundTaskStatus {
        BackgroundTaskStatus {
            session_reaper_healthy: self.session_manager.is_reaper_healthy().await,
            orphan_reaper_healthy: self.resource_manager.is_orphan_cleanup_healthy().await,
        }
    }

    pub async fn restart_background_tasks_if_needed(&self) -> RestartReport {
        RestartReport {
            session_reaper_restarted: self.session_manager.restart_reaper_if_needed().await,
            orphan_reaper_restarted: self.resource_manager.restart_orphan_cleanup_if_needed().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CodeRunOutcome, CommandRunOutcome, SandboxMetric};
    use async_trait::async_trait;

    struct EchoRemote;

    #[async_trait]
    impl RemoteApi for EchoRemote {
        async fn start_sandbox(
            &self,
            _namespace: &str,
            _name: &str,
            _template: &str,
            _flavor: Flavor,
            _volumes: &[VolumeMapping],
            _start_timeout: Duration,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn stop_sandbox(&self, _namespace: &str, _name: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn run_code(
            &self,
            _namespace: &str,
            _name: &str,
            code: &str,
            _exec_timeout: Duration,
        ) -> Result<CodeRunOutcome, GatewayError> {
            Ok(CodeRunOutcome {
                stdout: code.to_string(),
                stderr: String::new(),
                status: "success".to_string(),
                language: None,
            })
        }

        async fn run_command(
            &self,
            _namespace: &str,
            _name: &str,
            _command: &str,
            _args: &[String],
            _exec_timeout: Duration,
        ) -> Result<CommandRunOutcome, GatewayError> {
            Ok(CommandRunOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
            })
        }

        async fn list_sandbox_metrics(&self, _namespace: &str) -> Result<Vec<SandboxMetric>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn gateway() -> Gateway {
        let config = Arc::new(GatewayConfig::default());
        let remote: Arc<dyn RemoteApi> = Arc::new(EchoRemote);
        let gw = Gateway::with_remote(config, remote);
        gw.start();
        gw
    }

    #[tokio::test]
    async fn simple_reuse_scenario() {
        let gw = gateway();
        let r1 = gw
            .execute_code("x=41\nprint(x+1)", Some("python"), None, None, None)
            .await
            .unwrap();
        assert!(r1.session_created);
        let r2 = gw
            .execute_code("print(x*2)", None, Some(r1.session_id.clone()), None, None)
            .await
            .unwrap();
        assert!(!r2.session_created);
        assert_eq!(r1.session_id, r2.session_id);
    }

    #[tokio::test]
    async fn calls_before_start_are_rejected() {
        let config = Arc::new(GatewayConfig::default());
        let remote: Arc<dyn RemoteApi> = Arc::new(EchoRemote);
        let gw = Gateway::with_remote(config, remote);
        let err = gw.execute_code("1", None, None, None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[tokio::test]
    async fn unsupported_template_rejected_without_rpc() {
        let gw = gateway();
        let err = gw.execute_code("1", Some("ruby"), None, None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::SandboxCreation { .. }));
    }
}
