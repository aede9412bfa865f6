// ABOUTME: Session-to-desktop-sandbox registry with lazy creation and TTL-based reaping
// ABOUTME: At most one desktop container per session; background reaper reclaims aged sandboxes

use crate::desktop::DesktopProvisioner;
use crate::error::Result;
use crate::types::{SandboxStatus, SessionSandboxInfo};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the reaper scans for expired sandboxes
const REAPER_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Maximum wall-clock age of a desktop sandbox before the reaper reclaims it
const SANDBOX_TTL_HOURS: i64 = 2;

type SessionMap = Arc<RwLock<HashMap<String, SessionSandboxInfo>>>;

/// Maps session IDs to desktop sandboxes.
///
/// The session map is safe for concurrent reads and writes; only the
/// create-or-reuse path takes the single creation lock, which is
/// intentionally coarse because container creation is rare relative to
/// lookups. The engine remains the source of truth for container state; the
/// cached status is a best-effort mirror re-validated on reads.
///
/// The background reaper is owned by the registry's lifecycle: spawned on
/// construction and cancelled by `shutdown_all`.
pub struct SandboxSessionRegistry {
    provisioner: Arc<dyn DesktopProvisioner>,
    sessions: SessionMap,
    creation_lock: Mutex<()>,
    ttl: ChronoDuration,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl SandboxSessionRegistry {
    pub fn new(provisioner: Arc<dyn DesktopProvisioner>) -> Self {
        Self::with_ttl(provisioner, ChronoDuration::hours(SANDBOX_TTL_HOURS))
    }

    pub fn with_ttl(provisioner: Arc<dyn DesktopProvisioner>, ttl: ChronoDuration) -> Self {
        Self::with_policy(provisioner, ttl, REAPER_PERIOD)
    }

    /// Construct a registry with an explicit reaping policy.
    ///
    /// The reaper task is spawned here so the registry owns it from birth and
    /// cancels it in `shutdown_all`; construction must therefore happen inside
    /// a tokio runtime.
    pub fn with_policy(
        provisioner: Arc<dyn DesktopProvisioner>,
        ttl: ChronoDuration,
        reaper_period: Duration,
    ) -> Self {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

        let reaper = {
            let sessions = Arc::clone(&sessions);
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reaper_period);
                // Consume the immediate first tick; the first real pass runs
                // one full period after construction
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    Self::reap_expired(&sessions, &provisioner, ttl).await;
                }
            })
        };
        info!(
            "Sandbox reaper started (period: {:?}, ttl: {})",
            reaper_period, ttl
        );

        Self {
            provisioner,
            sessions,
            creation_lock: Mutex::new(()),
            ttl,
            reaper: StdMutex::new(Some(reaper)),
        }
    }

    /// Return the session's sandbox, creating one if none is available.
    ///
    /// Serialized by the creation lock so concurrent requests for the same
    /// session cannot race to create two containers. A `Creating` placeholder
    /// is visible to readers while provisioning runs; failures leave an
    /// `Error` entry and propagate.
    pub async fn get_or_create(&self, session_id: &str) -> Result<SessionSandboxInfo> {
        let _creation_guard = self.creation_lock.lock().await;

        if let Some(info) = self.sessions.read().await.get(session_id) {
            if info.is_available() {
                debug!("Reusing desktop sandbox for session {}", session_id);
                return Ok(info.clone());
            }
        }

        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionSandboxInfo::creating(session_id),
        );

        match self.provisioner.create_sandbox(session_id).await {
            Ok(desktop) => {
                let info = SessionSandboxInfo::running(session_id, desktop);
                self.sessions
                    .write()
                    .await
                    .insert(session_id.to_string(), info.clone());
                Ok(info)
            }
            Err(e) => {
                warn!("Desktop creation for session {} failed: {}", session_id, e);
                self.sessions
                    .write()
                    .await
                    .insert(session_id.to_string(), SessionSandboxInfo::failed(session_id));
                Err(e)
            }
        }
    }

    /// Read-only lookup. A `Running` entry whose container has disappeared is
    /// downgraded to `Stopped` in the cache (self-healing read).
    pub async fn get(&self, session_id: &str) -> Option<SessionSandboxInfo> {
        let info = self.sessions.read().await.get(session_id).cloned()?;

        if info.status == SandboxStatus::Running {
            if let Some(container_id) = &info.container_id {
                if !self.provisioner.is_running(container_id).await {
                    debug!(
                        "Container for session {} is gone, marking stopped",
                        session_id
                    );
                    let mut sessions = self.sessions.write().await;
                    if let Some(entry) = sessions.get_mut(session_id) {
                        entry.status = SandboxStatus::Stopped;
                        return Some(entry.clone());
                    }
                    return None;
                }
            }
        }

        Some(info)
    }

    /// Remove the session's entry and destroy its container. Idempotent and
    /// infallible: unknown sessions and destruction failures are logged only.
    pub async fn destroy(&self, session_id: &str) {
        match self.sessions.write().await.remove(session_id) {
            Some(info) => {
                if let Some(container_id) = info.container_id {
                    self.provisioner.destroy_sandbox(&container_id).await;
                }
                info!("Destroyed desktop sandbox for session {}", session_id);
            }
            None => debug!("No desktop sandbox registered for session {}", session_id),
        }
    }

    /// Number of sandboxes currently available to their sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|info| info.is_available())
            .count()
    }

    /// One reaper pass: destroy every sandbox older than the TTL. Pure
    /// age-since-creation policy; actual usage is not considered.
    pub async fn run_reaper_pass(&self) {
        Self::reap_expired(&self.sessions, &self.provisioner, self.ttl).await;
    }

    async fn reap_expired(
        sessions: &RwLock<HashMap<String, SessionSandboxInfo>>,
        provisioner: &Arc<dyn DesktopProvisioner>,
        ttl: ChronoDuration,
    ) {
        let cutoff = Utc::now() - ttl;
        // Snapshot first so destruction never holds the map across engine calls
        let expired: Vec<String> = sessions
            .read()
            .await
            .values()
            .filter(|info| info.created_at < cutoff)
            .map(|info| info.session_id.clone())
            .collect();

        for session_id in expired {
            info!("Reaping expired desktop sandbox for session {}", session_id);
            let removed = sessions.write().await.remove(&session_id);
            if let Some(info) = removed {
                if let Some(container_id) = info.container_id {
                    provisioner.destroy_sandbox(&container_id).await;
                }
            }
        }
    }

    /// Destroy every remaining sandbox and cancel the reaper. Invoked once at
    /// process shutdown; best-effort throughout.
    pub async fn shutdown_all(&self) {
        if let Ok(mut reaper) = self.reaper.lock() {
            if let Some(handle) = reaper.take() {
                handle.abort();
            }
        }

        let entries: Vec<(String, SessionSandboxInfo)> =
            self.sessions.write().await.drain().collect();
        let count = entries.len();
        for (session_id, info) in entries {
            if let Some(container_id) = info.container_id {
                self.provisioner.destroy_sandbox(&container_id).await;
            }
            debug!("Shut down desktop sandbox for session {}", session_id);
        }
        info!("Shut down {} desktop sandbox(es)", count);
    }
}
