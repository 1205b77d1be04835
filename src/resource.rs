//! Global admission control, LRU eviction, and orphan reconciliation.
//!
//! Grounded on `resource_manager.py`: `check_resource_limits`/
//! `validate_resource_request` → `admit_and_get_or_create` (the capacity
//! decision and the registry insertion are delegated to
//! `SessionManager::try_get_or_create` as one atomic operation, so the
//! check-then-insert race the Python original's `asyncio.Lock` prevents is
//! prevented here too), `_evict_lru_sessions` → `evict_lru`,
//! `cleanup_orphan_sandboxes` → `reconcile_orphans_once`/the orphan reaper
//! loop, and the rolling `_total_cleanup_cycles`/`_total_orphans_cleaned`/
//! `_cleanup_errors` counters → `OrphanCleanupStats`. Bounded-concurrency
//! stop sweeps use a `tokio::sync::Semaphore` of size 5, mirroring the
//! Python `asyncio.Semaphore(min(5, len(orphans)))`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, ResourceKind};
use crate::logging::log_resource_event;
use crate::models::{Flavor, ResourceStats, Template};
use crate::remote::RemoteApi;
use crate::session::{AdmitOutcome, ManagedSession, SessionManager};

const ORPHAN_REAPER_CONCURRENCY: usize = 5;
const STATS_LOG_EVERY_N_CYCLES: u64 = 10;

/// One sandbox the remote server reports, classified against the local
/// registry. Mirrors `resource_manager.py::get_running_sandboxes_info`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxClassification {
    pub namespace: String,
    pub name: String,
    pub managed: bool,
}

/// Rolling orphan-reaper statistics, mirroring
/// `resource_manager.py::get_orphan_cleanup_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanCleanupStats {
    pub cycles: u64,
    pub orphans_cleaned_total: u64,
    pub cleanup_errors_total: u64,
    pub last_cycle_duration_ms: u64,
    pub avg_orphans_per_cycle: f64,
}

/// Admission + orphan reconciliation for the whole gateway.
pub struct ResourceManager {
    config: Arc<GatewayConfig>,
    remote: Arc<dyn RemoteApi>,
    session_manager: Arc<SessionManager>,
    started_at: Instant,
    orphan_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cycles: AtomicU64,
    orphans_cleaned_total: AtomicU64,
    cleanup_errors_total: AtomicU64,
    last_cycle_duration_ms: AtomicU64,
}

impl ResourceManager {
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>, remote: Arc<dyn RemoteApi>, session_manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            remote,
            session_manager,
            started_at: Instant::now(),
            orphan_handle: tokio::sync::Mutex::new(None),
            cycles: AtomicU64::new(0),
            orphans_cleaned_total: AtomicU64::new(0),
            cleanup_errors_total: AtomicU64::new(0),
            last_cycle_duration_ms: AtomicU64::new(0),
        }
    }

    pub async fn get_resource_stats(&self) -> ResourceStats {
        let sessions = self.session_manager.all_sessions().await;
        let mut sessions_by_flavor: HashMap<Flavor, usize> = HashMap::new();
        let mut total_memory_mb = 0u64;
        let mut total_cpus = 0.0f64;
        let mut active_sessions = 0usize;

        for session in &sessions {
            if session.status() == crate::models::SessionStatus::Stopped {
                continue;
            }
            active_sessions += 1;
            *sessions_by_flavor.entry(session.flavor).or_insert(0) += 1;
            total_memory_mb += session.flavor.memory_mb();
            total_cpus += session.flavor.cpus();
        }

        ResourceStats {
            active_sessions,
            max_sessions: self.config.max_concurrent_sessions,
            sessions_by_flavor,
            total_memory_mb,
            total_cpus,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Admit a request and look up/create its session in one operation: the
    /// capacity decision and the registry insertion happen inside a single
    /// hold of `SessionManager`'s registry write lock
    /// (`SessionManager::try_get_or_create`), so two concurrent callers at
    /// the cap boundary can never both be admitted — see spec.md §4.4 and
    /// DESIGN.md. If the atomic check is denied and LRU eviction is
    /// enabled, evicts the shortfall and retries once; a second denial
    /// raises a `ResourceLimit` error naming the violated axis.
    pub async fn admit_and_get_or_create(
        &self,
        session_id: Option<String>,
        template: Template,
        flavor: Flavor,
    ) -> Result<(Arc<ManagedSession>, bool), GatewayError> {
        match self.try_admit(session_id.as_deref(), template, flavor).await {
            AdmitOutcome::Existing(session) => Ok((session, false)),
            AdmitOutcome::Created(session) => {
                log_resource_event("admit", Some(flavor), 0, self.config.max_concurrent_sessions);
                Ok((session, true))
            }
            AdmitOutcome::Denied {
                sessions_to_evict,
                memory_to_free_mb,
            } => {
                if !self.config.enable_lru_eviction {
                    return Err(self.deny(flavor).await);
                }
                self.evict_lru(sessions_to_evict, memory_to_free_mb).await;
                match self.try_admit(session_id.as_deref(), template, flavor).await {
                    AdmitOutcome::Existing(session) => Ok((session, false)),
                    AdmitOutcome::Created(session) => {
                        log_resource_event("admit", Some(flavor), 0, self.config.max_concurrent_sessions);
                        Ok((session, true))
                    }
                    AdmitOutcome::Denied { .. } => Err(self.deny(flavor).await),
                }
            }
        }
    }

    async fn try_admit(&self, session_id: Option<&str>, template: Template, flavor: Flavor) -> AdmitOutcome {
        self.session_manager
            .try_get_or_create(
                session_id,
                template,
                flavor,
                self.config.max_concurrent_sessions,
                self.config.max_total_memory_mb,
            )
            .await
    }

    /// Build the `ResourceLimit` error naming the axis still violated after
    /// admission (and any eviction attempt) failed.
    async fn deny(&self, flavor: Flavor) -> GatewayError {
        let stats = self.get_resource_stats().await;
        log_resource_event(
            "deny",
            Some(flavor),
            stats.active_sessions,
            self.config.max_concurrent_sessions,
        );

        if stats.active_sessions + 1 > self.config.max_concurrent_sessions {
            return GatewayError::ResourceLimit {
                resource_type: ResourceKind::Sessions,
                current: stats.active_sessions.to_string(),
                limit: self.config.max_concurrent_sessions.to_string(),
            };
        }
        let cap = self.config.max_total_memory_mb.unwrap_or(u64::MAX);
        GatewayError::ResourceLimit {
            resource_type: ResourceKind::Memory,
            current: (stats.total_memory_mb + flavor.memory_mb()).to_string(),
            limit: cap.to_string(),
        }
    }

    /// Stop the least-recently-accessed evictable sessions until both
    /// thresholds are met. Returns the number of sessions stopped.
    pub async fn evict_lru(&self, min_sessions: usize, min_memory_mb: u64) -> usize {
        let mut candidates: Vec<_> = self
            .session_manager
            .all_sessions()
            .await
            .into_iter()
            .filter(|s| s.can_be_evicted())
            .collect();
        // Stable sort: oldest `last_accessed` first, ties keep insertion order.
        candidates.sort_by_key(|s| s.last_accessed());

        let mut evicted = 0usize;
        let mut freed_memory_mb = 0u64;
        for session in candidates {
            if evicted >= min_sessions && freed_memory_mb >= min_memory_mb {
                break;
            }
            let flavor_memory = session.flavor.memory_mb();
            if self.session_manager.stop(&session.session_id).await {
                evicted += 1;
                freed_memory_mb += flavor_memory;
            }
        }
        if evicted > 0 {
            info!(evicted, freed_memory_mb, "LRU eviction freed capacity");
        }
        evicted
    }

    async fn fetch_running_sandboxes(&self) -> Result<Vec<(String, String)>, GatewayError> {
        let metrics = self.remote.list_sandbox_metrics("*").await?;
        Ok(metrics
            .into_iter()
            .filter(|m| m.running)
            .map(|m| (m.namespace, m.name))
            .collect())
    }

    async fn known_sandboxes(&self) -> HashSet<(String, String)> {
        self.session_manager
            .all_sessions()
            .await
            .into_iter()
            .filter(|s| s.status() != crate::models::SessionStatus::Stopped)
            .map(|s| (s.namespace.clone(), s.sandbox_name.clone()))
            .collect()
    }

    /// Classify every remotely-running sandbox as managed or orphaned,
    /// without stopping anything.
    pub async fn get_running_sandboxes_info(&self) -> Result<Vec<SandboxClassification>, GatewayError> {
        let running = self.fetch_running_sandboxes().await?;
        let known = self.known_sandboxes().await;
        Ok(running
            .into_iter()
            .map(|(namespace, name)| {
                let managed = known.contains(&(namespace.clone(), name.clone()));
                SandboxClassification { namespace, name, managed }
            })
            .collect())
    }

    /// Run one orphan-reconciliation pass and stop whatever it finds.
    /// Returns the number of orphans stopped. Used both by the background
    /// loop and by the on-demand `CleanupOrphans` API.
    pub async fn reconcile_orphans_once(&self) -> Result<usize, GatewayError> {
        let started = Instant::now();
        let running = self.fetch_running_sandboxes().await?;
        let known = self.known_sandboxes().await;
        let orphans: Vec<(String, String)> = running.into_iter().filter(|k| !known.contains(k)).collect();

        if orphans.is_empty() {
            self.record_cycle(0, 0, started.elapsed());
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(ORPHAN_REAPER_CONCURRENCY));
        let mut handles = Vec::with_capacity(orphans.len());
        for (namespace, name) in orphans.clone() {
            let remote = Arc::clone(&self.remote);
            let permit = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                remote.stop_sandbox(&namespace, &name).await
            }));
        }

        let mut stopped = 0usize;
        let mut errors = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to stop orphan sandbox");
                    errors += 1;
                }
                Err(e) => {
                    warn!(error = %e, "orphan stop task panicked");
                    errors += 1;
                }
            }
        }

        self.record_cycle(stopped, errors, started.elapsed());
        Ok(stopped)
    }

    fn record_cycle(&self, stopped: usize, errors: usize, elapsed: Duration) {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        self.orphans_cleaned_total.fetch_add(stopped as u64, Ordering::Relaxed);
        self.cleanup_errors_total.fetch_add(errors as u64, Ordering::Relaxed);
        self.last_cycle_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        if cycle % STATS_LOG_EVERY_N_CYCLES == 0 {
            info!(
                cycle,
                orphans_cleaned_total = self.orphans_cleaned_total.load(Ordering::Relaxed),
                cleanup_errors_total = self.cleanup_errors_total.load(Ordering::Relaxed),
                "orphan reaper statistics"
            );
        }
    }

    pub fn get_orphan_cleanup_stats(&self) -> OrphanCleanupStats {
        let cycles = self.cycles.load(Ordering::Relaxed);
        let total = self.orphans_cleaned_total.load(Ordering::Relaxed);
        OrphanCleanupStats {
            cycles,
            orphans_cleaned_total: total,
            cleanup_errors_total: self.cleanup_errors_total.load(Ordering::Relaxed),
            last_cycle_duration_ms: self.last_cycle_duration_ms.load(Ordering::Relaxed),
            avg_orphans_per_cycle: if cycles == 0 { 0.0 } else { total as f64 / cycles as f64 },
        }
    }

    pub fn start_orphan_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.orphan_cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.reconcile_orphans_once().await {
                    Ok(count) if count > 0 => debug!(count, "orphan reaper stopped orphaned sandboxes"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "orphan reaper cycle failed"),
                }
            }
        })
    }

    pub async fn pause_orphan_reaper(&self) {
        if let Some(handle) = self.orphan_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn resume_orphan_reaper(self: &Arc<Self>) {
        let mut guard = self.orphan_handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.start_orphan_reaper());
        }
    }

    pub async fn is_orphan_cleanup_healthy(&self) -> bool {
        match self.orphan_handle.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub async fn restart_orphan_cleanup_if_needed(self: &Arc<Self>) -> bool {
        let needs_restart = {
            let guard = self.orphan_handle.lock().await;
            match guard.as_ref() {
                Some(handle) => handle.is_finished(),
                None => true,
            }
        };
        if needs_restart {
            self.resume_orphan_reaper().await;
        }
        needs_restart
    }

    /// Stop the orphan reaper task. Pure task-lifecycle teardown; no
    /// references to live sessions are touched here (see DESIGN.md's
    /// cyclic-shutdown-avoidance note).
    pub async fn stop(&self) {
        self.pause_orphan_reaper().await;
    }
}
