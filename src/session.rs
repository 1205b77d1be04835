//! Session identity, reuse, and the idle-timeout reaper.
//!
//! `ManagedSession` mirrors `session_manager.py::ManagedSession`: identity,
//! chosen template/flavor, state machine, and the RemoteClient calls it
//! wraps, serialized by a per-session lock. `SessionManager` mirrors
//! `session_manager.py::SessionManager` plus the teacher's `SessionManager`
//! (`session.rs`): a registry guarded by a short-lived `RwLock`, reused as-is
//! here down to the two-tier locking split (registry lock for O(1) map ops,
//! a distinct per-session lock for anything that makes an RPC).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{ExecutionErrorKind, GatewayError};
use crate::logging::{log_sandbox_event, log_session_event};
use crate::models::{CommandResult, ExecutionResult, Flavor, SessionInfo, SessionStatus, Template};
use crate::remote::RemoteApi;

/// Bounded concurrency for reaper stop sweeps, matching the original's
/// `asyncio.Semaphore(min(5, len(candidates)))` pattern.
const REAPER_CONCURRENCY: usize = 5;

fn classify_execution_error(message: &str) -> ExecutionErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ExecutionErrorKind::Timeout
    } else if lower.contains("syntax") || lower.contains("compil") {
        ExecutionErrorKind::Compilation
    } else {
        ExecutionErrorKind::Runtime
    }
}

/// A single reusable sandbox handle. See spec §4.2 for the full state
/// machine; `op_lock` is the serialization point for `EnsureStarted`,
/// `RunCode`/`RunCommand`, and `Stop`.
pub struct ManagedSession {
    pub session_id: String,
    pub sandbox_name: String,
    pub namespace: String,
    pub template: Template,
    pub flavor: Flavor,
    pub created_at: DateTime<Utc>,
    status: std::sync::Mutex<SessionStatus>,
    remote_started: AtomicBool,
    last_accessed: std::sync::Mutex<Instant>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ManagedSession {
    #[must_use]
    pub fn new(session_id: String, template: Template, flavor: Flavor) -> Self {
        let prefix: String = session_id.chars().take(8).collect();
        let sandbox_name = format!("session-{prefix}");
        Self {
            session_id,
            sandbox_name,
            namespace: "default".to_string(),
            template,
            flavor,
            created_at: Utc::now(),
            status: std::sync::Mutex::new(SessionStatus::Creating),
            remote_started: AtomicBool::new(false),
            last_accessed: std::sync::Mutex::new(Instant::now()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    #[must_use]
    pub fn last_accessed(&self) -> Instant {
        *self
            .last_accessed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bump `last_accessed` to now. Called on every cache hit before handing
    /// the session back to a caller.
    pub fn touch(&self) {
        *self
            .last_accessed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.status() == SessionStatus::Stopped || self.last_accessed().elapsed() > timeout
    }

    #[must_use]
    pub fn can_be_evicted(&self) -> bool {
        !matches!(self.status(), SessionStatus::Processing | SessionStatus::Creating)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            template: self.template,
            flavor: self.flavor,
            created_at: self.created_at,
            last_accessed: Utc::now() - chrono::Duration::from_std(self.last_accessed().elapsed()).unwrap_or_default(),
            status: self.status(),
            namespace: self.namespace.clone(),
            sandbox_name: self.sandbox_name.clone(),
        }
    }

    /// Idempotent. Issues at most one `sandbox.start` call across any number
    /// of concurrent callers (serialized by `op_lock`).
    pub async fn ensure_started(
        &self,
        remote: &dyn RemoteApi,
        volumes: &[crate::models::VolumeMapping],
        start_timeout: Duration,
    ) -> Result<(), GatewayError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_started_locked(remote, volumes, start_timeout).await
    }

    /// Assumes `op_lock` is already held by the caller.
    async fn ensure_started_locked(
        &self,
        remote: &dyn RemoteApi,
        volumes: &[crate::models::VolumeMapping],
        start_timeout: Duration,
    ) -> Result<(), GatewayError> {
        if self.remote_started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.set_status(SessionStatus::Creating);
        match remote
            .start_sandbox(
                &self.namespace,
                &self.sandbox_name,
                &self.template.to_string(),
                self.flavor,
                volumes,
                start_timeout,
            )
            .await
        {
            Ok(()) => {
                self.set_status(SessionStatus::Ready);
                self.remote_started.store(true, Ordering::Release);
                log_sandbox_event("start", &self.namespace, &self.sandbox_name, true);
                log_session_event(&self.session_id, "started", SessionStatus::Ready, self.template);
                Ok(())
            }
            Err(e) => {
                self.set_status(SessionStatus::Error);
                log_sandbox_event("start", &self.namespace, &self.sandbox_name, false);
                Err(GatewayError::SandboxCreation {
                    template: self.template.to_string(),
                    flavor: self.flavor.to_string(),
                    message: e.to_string(),
                    source: Some(anyhow::anyhow!(e)),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_code(
        &self,
        remote: &dyn RemoteApi,
        code: &str,
        timeout: Option<Duration>,
        default_execution_timeout: Duration,
        volumes: &[crate::models::VolumeMapping],
        start_timeout: Duration,
    ) -> Result<ExecutionResult, GatewayError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_started_locked(remote, volumes, start_timeout).await?;
        self.set_status(SessionStatus::Processing);
        self.touch();

        let effective_timeout = timeout.map_or(default_execution_timeout, |t| t.min(default_execution_timeout));
        let started = Instant::now();
        let result = remote
            .run_code(&self.namespace, &self.sandbox_name, code, effective_timeout)
            .await;
        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(outcome) => {
                self.set_status(SessionStatus::Ready);
                self.touch();
                let success = !outcome.has_error();
                Ok(ExecutionResult {
                    session_id: self.session_id.clone(),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    success,
                    execution_time_ms,
                    session_created: false,
                    template: self.template,
                })
            }
            Err(e) => {
                self.set_status(SessionStatus::Error);
                Err(GatewayError::CodeExecution {
                    kind: classify_execution_error(&e.to_string()),
                    session_id: self.session_id.clone(),
                    message: e.to_string(),
                    source: Some(anyhow::anyhow!(e)),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_command(
        &self,
        remote: &dyn RemoteApi,
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
        default_execution_timeout: Duration,
        volumes: &[crate::models::VolumeMapping],
        start_timeout: Duration,
    ) -> Result<CommandResult, GatewayError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_started_locked(remote, volumes, start_timeout).await?;
        self.set_status(SessionStatus::Processing);
        self.touch();

        let effective_timeout = timeout.map_or(default_execution_timeout, |t| t.min(default_execution_timeout));
        let started = Instant::now();
        let result = remote
            .run_command(&self.namespace, &self.sandbox_name, command, args, effective_timeout)
            .await;
        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(outcome) => {
                self.set_status(SessionStatus::Ready);
                self.touch();
                Ok(CommandResult {
                    session_id: self.session_id.clone(),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                    success: outcome.exit_code == 0,
                    execution_time_ms,
                    session_created: false,
                    command: command.to_string(),
                    args: args.to_vec(),
                })
            }
            Err(e) => {
                self.set_status(SessionStatus::Error);
                Err(GatewayError::CommandExecution {
                    session_id: self.session_id.clone(),
                    command: command.to_string(),
                    message: e.to_string(),
                    source: Some(anyhow::anyhow!(e)),
                })
            }
        }
    }

    /// Idempotent. Best-effort remote stop; always leaves `status == STOPPED`.
    pub async fn stop(&self, remote: &dyn RemoteApi) {
        let _guard = self.op_lock.lock().await;
        if self.status() == SessionStatus::Stopped {
            return;
        }
        if self.remote_started.load(Ordering::Acquire) {
            if let Err(e) = remote.stop_sandbox(&self.namespace, &self.sandbox_name).await {
                warn!(session_id = %self.session_id, error = %e, "failed to stop sandbox, continuing");
            }
        }
        self.set_status(SessionStatus::Stopped);
        log_sandbox_event("stop", &self.namespace, &self.sandbox_name, true);
        log_session_event(&self.session_id, "stopped", SessionStatus::Stopped, self.template);
    }
}

/// Outcome of `SessionManager::try_get_or_create`'s atomic check-and-insert.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// A live, non-expired session was found and reused.
    Existing(Arc<ManagedSession>),
    /// Capacity allowed insertion; a new placeholder was installed.
    Created(Arc<ManagedSession>),
    /// Capacity would be exceeded. Carries the shortfall so the caller can
    /// run LRU eviction and retry.
    Denied { sessions_to_evict: usize, memory_to_free_mb: u64 },
}

/// Read-only diagnostics mirroring `session_manager.py::get_cleanup_stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionCleanupStats {
    pub total_sessions: usize,
    pub by_status: HashMap<String, usize>,
    pub oldest_session_age_seconds: Option<u64>,
    pub reaper_healthy: bool,
}

/// Registry of `ManagedSession`s, keyed by session id.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ManagedSession>>>,
    config: Arc<GatewayConfig>,
    remote: Arc<dyn RemoteApi>,
    reaper_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cleanup_cycles: AtomicU64,
    sessions_cleaned: AtomicU64,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>, remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            remote,
            reaper_handle: tokio::sync::Mutex::new(None),
            cleanup_cycles: AtomicU64::new(0),
            sessions_cleaned: AtomicU64::new(0),
        }
    }

    /// Look up or create a session, holding the registry write lock across
    /// both the capacity recheck and the insertion of the new placeholder,
    /// so that two concurrent callers can never both observe spare capacity
    /// and both insert past `max_concurrent_sessions`/`max_total_memory_mb`
    /// — spec.md §4.4: "The registry lock is therefore acquired for the
    /// admission decision and the insertion of the new placeholder
    /// ManagedSession together". `Denied` carries the shortfall so the
    /// caller (`ResourceManager`) can run LRU eviction and retry.
    ///
    /// An expired existing session is removed and stopped *before* the
    /// atomic section, since stopping issues an RPC and must not happen
    /// while the registry lock is held.
    ///
    /// Template/flavor mismatch against a reused live session is not
    /// checked — see DESIGN.md's open-question resolution #1.
    pub async fn try_get_or_create(
        &self,
        session_id: Option<&str>,
        template: Template,
        flavor: Flavor,
        max_concurrent_sessions: usize,
        max_total_memory_mb: Option<u64>,
    ) -> AdmitOutcome {
        if let Some(id) = session_id {
            let stale = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(id) {
                    Some(session) if session.is_expired(self.config.session_timeout) => sessions.remove(id),
                    _ => None,
                }
            };
            if let Some(stale) = stale {
                stale.stop(self.remote.as_ref()).await;
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(id) = session_id {
            if let Some(session) = sessions.get(id) {
                session.touch();
                return AdmitOutcome::Existing(Arc::clone(session));
            }
        }

        let mut active = 0usize;
        let mut total_memory_mb = 0u64;
        for session in sessions.values() {
            if session.status() != SessionStatus::Stopped {
                active += 1;
                total_memory_mb += session.flavor.memory_mb();
            }
        }

        let sessions_to_evict = (active + 1).saturating_sub(max_concurrent_sessions);
        let memory_to_free_mb =
            max_total_memory_mb.map_or(0, |cap| (total_memory_mb + flavor.memory_mb()).saturating_sub(cap));

        if sessions_to_evict > 0 || memory_to_free_mb > 0 {
            return AdmitOutcome::Denied { sessions_to_evict, memory_to_free_mb };
        }

        let id = session_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
        let session = Arc::new(ManagedSession::new(id.clone(), template, flavor));
        sessions.insert(id, Arc::clone(&session));
        AdmitOutcome::Created(session)
    }

    /// Look up or create a session with no capacity check. Returns
    /// `(session, created)`. Used by callers that bypass `ResourceManager`
    /// admission (tests, and diagnostic callers); the gateway's execute path
    /// goes through `ResourceManager::admit_and_get_or_create` instead, so
    /// the capacity check and the insert stay in one atomic section.
    pub async fn get_or_create(
        &self,
        session_id: Option<String>,
        template: Template,
        flavor: Flavor,
    ) -> (Arc<ManagedSession>, bool) {
        match self
            .try_get_or_create(session_id.as_deref(), template, flavor, usize::MAX, None)
            .await
        {
            AdmitOutcome::Existing(session) => (session, false),
            AdmitOutcome::Created(session) => (session, true),
            AdmitOutcome::Denied { .. } => unreachable!("unbounded admission never denies"),
        }
    }

    /// Stop and remove a session by id. Returns whether it existed.
    pub async fn stop(&self, session_id: &str) -> bool {
        let session = self.sessions.write().await.remove(session_id);
        match session {
            Some(session) => {
                session.stop(self.remote.as_ref()).await;
                true
            }
            None => false,
        }
    }

    pub async fn get_sessions(&self, session_id: Option<&str>) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        match session_id {
            Some(id) => sessions.get(id).map(|s| s.snapshot()).into_iter().collect(),
            None => sessions.values().map(|s| s.snapshot()).collect(),
        }
    }

    /// Snapshot of live `Arc` handles, used by `ResourceManager` for LRU
    /// sorting and admission accounting. Cloning `Arc`s, not the sessions.
    pub async fn all_sessions(&self) -> Vec<Arc<ManagedSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status() != SessionStatus::Stopped)
            .count()
    }

    /// Scan for idle/lifetime-expired sessions and stop them, bounded
    /// concurrency `REAPER_CONCURRENCY`.
    pub async fn cleanup_expired(&self) {
        let expired: Vec<Arc<ManagedSession>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_expired(self.config.session_timeout))
                .cloned()
                .collect()
        };

        self.cleanup_cycles.fetch_add(1, Ordering::Relaxed);
        if expired.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(REAPER_CONCURRENCY));
        let mut handles = Vec::with_capacity(expired.len());
        for session in &expired {
            let session = Arc::clone(session);
            let remote = Arc::clone(&self.remote);
            let permit = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                session.stop(remote.as_ref()).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut sessions = self.sessions.write().await;
        for session in &expired {
            sessions.remove(&session.session_id);
        }
        self.sessions_cleaned.fetch_add(expired.len() as u64, Ordering::Relaxed);
        debug!(count = expired.len(), "idle reaper stopped expired sessions");
    }

    /// Start the idle-timeout reaper. Returns the handle; call again only
    /// after `restart_reaper_if_needed` observes it has exited.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut cycle = 0u64;
            loop {
                ticker.tick().await;
                manager.cleanup_expired().await;
                cycle += 1;
                if cycle % 10 == 0 {
                    info!(cycle, "idle reaper statistics: {} sessions", manager.sessions.read().await.len());
                }
            }
        })
    }

    pub async fn pause_reaper(&self) {
        if let Some(handle) = self.reaper_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn resume_reaper(self: &Arc<Self>) {
        let mut guard = self.reaper_handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.start_reaper());
        }
    }

    /// True if the reaper task is registered and has not exited.
    pub async fn is_reaper_healthy(&self) -> bool {
        match self.reaper_handle.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub async fn restart_reaper_if_needed(self: &Arc<Self>) -> bool {
        let needs_restart = {
            let guard = self.reaper_handle.lock().await;
            match guard.as_ref() {
                Some(handle) => handle.is_finished(),
                None => true,
            }
        };
        if needs_restart {
            self.resume_reaper().await;
        }
        needs_restart
    }

    pub async fn get_cleanup_stats(&self) -> SessionCleanupStats {
        let sessions = self.sessions.read().await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut oldest: Option<Duration> = None;
        for session in sessions.values() {
            *by_status.entry(session.status().to_string()).or_insert(0) += 1;
            let age = Utc::now().signed_duration_since(session.created_at);
            if let Ok(age) = age.to_std() {
                oldest = Some(oldest.map_or(age, |o| o.max(age)));
            }
        }
        SessionCleanupStats {
            total_sessions: sessions.len(),
            by_status,
            oldest_session_age_seconds: oldest.map(|d| d.as_secs()),
            reaper_healthy: self.is_reaper_healthy().await,
        }
    }

    /// Stop every session concurrently, bounded by `deadline`. Returns
    /// `true` if all sessions stopped before the deadline elapsed.
    pub async fn graceful_shutdown(&self, deadline: Duration) -> bool {
        self.pause_reaper().await;
        let sessions: Vec<Arc<ManagedSession>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let remote = Arc::clone(&self.remote);
        let stop_all = async move {
            let mut handles = Vec::with_capacity(sessions.len());
            for session in sessions {
                let remote = Arc::clone(&remote);
                handles.push(tokio::spawn(async move {
                    session.stop(remote.as_ref()).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(deadline, stop_all).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CodeRunOutcome, CommandRunOutcome, SandboxMetric};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockRemote {
        start_calls: AtomicUsize,
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn start_sandbox(
            &self,
            _namespace: &str,
            _name: &str,
            _template: &str,
            _flavor: Flavor,
            _volumes: &[crate::models::VolumeMapping],
            _start_timeout: Duration,
        ) -> Result<(), GatewayError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(GatewayError::connection("http://mock", anyhow::anyhow!("refused")));
            }
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
                stdout: format!("ran: {code}"),
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

    fn config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig::default())
    }

    #[tokio::test]
    async fn ensure_started_issues_at_most_one_start_call() {
        let remote = Arc::new(MockRemote::default());
        let session = ManagedSession::new("abcdefgh1234".to_string(), Template::Python, Flavor::Small);
        session.ensure_started(remote.as_ref(), &[], Duration::from_secs(5)).await.unwrap();
        session.ensure_started(remote.as_ref(), &[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(remote.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_session() {
        let remote: Arc<dyn RemoteApi> = Arc::new(MockRemote::default());
        let manager = SessionManager::new(config(), remote);
        let (s1, created1) = manager.get_or_create(None, Template::Python, Flavor::Small).await;
        assert!(created1);
        let (s2, created2) = manager
            .get_or_create(Some(s1.session_id.clone()), Template::Python, Flavor::Small)
            .await;
        assert!(!created2);
        assert_eq!(s1.session_id, s2.session_id);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let remote = Arc::new(MockRemote::default());
        let session = ManagedSession::new("11112222".to_string(), Template::Python, Flavor::Small);
        session.ensure_started(remote.as_ref(), &[], Duration::from_secs(5)).await.unwrap();
        session.stop(remote.as_ref()).await;
        session.stop(remote.as_ref()).await;
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn sandbox_name_uses_first_eight_chars() {
        let session = ManagedSession::new("abcdefgh-1234-5678".to_string(), Template::Node, Flavor::Medium);
        assert_eq!(session.sandbox_name, "session-abcdefgh");
    }

    #[tokio::test]
    async fn stop_unknown_session_returns_false() {
        let remote: Arc<dyn RemoteApi> = Arc::new(MockRemote::default());
        let manager = SessionManager::new(config(), remote);
        assert!(!manager.stop("does-not-exist").await);
    }

    #[test]
    fn classify_execution_error_by_keyword() {
        assert_eq!(classify_execution_error("request timed out"), ExecutionErrorKind::Timeout);
        assert_eq!(classify_execution_error("operation timeout after 5s"), ExecutionErrorKind::Timeout);
        assert_eq!(
            classify_execution_error("SyntaxError: invalid syntax"),
            ExecutionErrorKind::Compilation
        );
        assert_eq!(classify_execution_error("compilation failed: unexpected token"), ExecutionErrorKind::Compilation);
        assert_eq!(classify_execution_error("NullPointerException at line 3"), ExecutionErrorKind::Runtime);
    }

    /// A remote double whose first `run_code`/`run_command` call reports a
    /// timeout (as the remote server would for a caller-timeout shorter
    /// than the sandbox's actual work), then succeeds on the next call.
    #[derive(Default)]
    struct TimeoutThenOkRemote {
        run_code_calls: AtomicUsize,
        run_command_calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteApi for TimeoutThenOkRemote {
        async fn start_sandbox(
            &self,
            _namespace: &str,
            _name: &str,
            _template: &str,
            _flavor: Flavor,
            _volumes: &[crate::models::VolumeMapping],
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
            if self.run_code_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(GatewayError::connection(
                    "http://mock",
                    anyhow::anyhow!("request timed out waiting for sandbox"),
                ));
            }
            Ok(CodeRunOutcome {
                stdout: format!("ran: {code}"),
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
            if self.run_command_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(GatewayError::connection(
                    "http://mock",
                    anyhow::anyhow!("request timed out waiting for sandbox"),
                ));
            }
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

    #[tokio::test]
    async fn run_code_timeout_error_leaves_session_reusable() {
        let remote = Arc::new(TimeoutThenOkRemote::default());
        let session = ManagedSession::new("timeout-session".to_string(), Template::Python, Flavor::Small);

        let err = session
            .run_code(
                remote.as_ref(),
                "slow()",
                Some(Duration::from_millis(1)),
                Duration::from_secs(300),
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::CodeExecution { kind, .. } => assert_eq!(kind, ExecutionErrorKind::Timeout),
            other => panic!("expected CodeExecution timeout, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(!session.is_expired(Duration::from_secs(300)), "an errored session is not expired");

        let result = session
            .run_code(
                remote.as_ref(),
                "fast()",
                Some(Duration::from_secs(5)),
                Duration::from_secs(300),
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn run_command_timeout_error_leaves_session_reusable() {
        let remote = Arc::new(TimeoutThenOkRemote::default());
        let session = ManagedSession::new("timeout-session-cmd".to_string(), Template::Node, Flavor::Small);

        let err = session
            .run_command(
                remote.as_ref(),
                "sleep",
                &["5".to_string()],
                Some(Duration::from_millis(1)),
                Duration::from_secs(300),
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CommandExecution { .. }));
        assert_eq!(session.status(), SessionStatus::Error);

        let result = session
            .run_command(
                remote.as_ref(),
                "echo",
                &["hi".to_string()],
                Some(Duration::from_secs(5)),
                Duration::from_secs(300),
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(session.status(), SessionStatus::Ready);
    }
}
