//! Backend health supervisor.
//!
//! Owns the lazily connected [`StorageBackend`] handle and its lifecycle:
//!
//! ```text
//! Uninitialized -> Probing -> Ready
//!                          -> Unreachable -> Probing -> ...
//! ```
//!
//! A transport failure seen by any RPC drops the handle and moves the state to
//! `Unreachable`; the next auto-probe reconnects once.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnector, BackendError, StorageBackend};
use crate::error::{CsiError, Result};
use crate::metrics;
use crate::types::ServiceMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Uninitialized,
    Probing,
    Ready,
    Unreachable,
}

impl Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeState::Uninitialized => write!(f, "uninitialized"),
            ProbeState::Probing => write!(f, "probing"),
            ProbeState::Ready => write!(f, "ready"),
            ProbeState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Probe counters.
#[derive(Debug, Default)]
pub struct ProbeStats {
    probe_attempts: AtomicU64,
    probe_failures: AtomicU64,
    auto_probe_calls: AtomicU64,
}

/// Point-in-time copy of [`ProbeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStatsSnapshot {
    pub probe_attempts: u64,
    pub probe_failures: u64,
    pub auto_probe_calls: u64,
}

impl ProbeStats {
    /// Count an auto-probe call and return the new total.
    pub fn record_auto_probe(&self) -> u64 {
        self.auto_probe_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_attempt(&self, success: bool) {
        self.probe_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_probe_attempt(success);
    }

    pub fn snapshot(&self) -> ProbeStatsSnapshot {
        ProbeStatsSnapshot {
            probe_attempts: self.probe_attempts.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            auto_probe_calls: self.auto_probe_calls.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    state: ProbeState,
    backend: Option<Arc<dyn StorageBackend>>,
}

pub struct ProbeSupervisor {
    /// Absent for node-only processes, which never talk to the cluster
    connector: Option<Arc<dyn BackendConnector>>,
    mode: ServiceMode,
    node_id: String,
    auto_probe: bool,
    inner: RwLock<Inner>,
    /// Serializes (re)connection attempts
    connect_lock: Mutex<()>,
    stats: ProbeStats,
}

impl ProbeSupervisor {
    pub fn new(
        connector: Option<Arc<dyn BackendConnector>>,
        mode: ServiceMode,
        node_id: impl Into<String>,
        auto_probe: bool,
    ) -> Self {
        Self {
            connector,
            mode,
            node_id: node_id.into(),
            auto_probe,
            inner: RwLock::new(Inner {
                state: ProbeState::Uninitialized,
                backend: None,
            }),
            connect_lock: Mutex::new(()),
            stats: ProbeStats::default(),
        }
    }

    pub async fn state(&self) -> ProbeState {
        self.inner.read().await.state
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Forced synchronous readiness check.
    pub async fn probe(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.probe_locked().await
    }

    /// Make sure the plugin is ready before a data operation.
    ///
    /// Returns immediately when already `Ready`. Otherwise performs one
    /// synchronous probe, unless auto-probing is disabled.
    pub async fn auto_probe(&self) -> Result<()> {
        if self.inner.read().await.state == ProbeState::Ready {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        // Another task may have connected while we waited
        if self.inner.read().await.state == ProbeState::Ready {
            return Ok(());
        }

        if !self.auto_probe {
            warn!("Backend not probed and auto probe is disabled");
            return Err(CsiError::failed_precondition("auto probe is not enabled"));
        }

        self.probe_locked().await
    }

    /// Connected backend handle, auto-probing first.
    pub async fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        self.auto_probe().await?;
        self.inner
            .read()
            .await
            .backend
            .clone()
            .ok_or_else(|| CsiError::failed_precondition("no backend connection is established"))
    }

    /// Drop the cached handle after a transport failure.
    pub async fn mark_unreachable(&self) {
        let mut inner = self.inner.write().await;
        if inner.backend.is_some() {
            warn!("Clearing stale backend connection");
            metrics::set_backend_connected(false);
        }
        inner.backend = None;
        inner.state = ProbeState::Unreachable;
    }

    /// Inspect a backend failure and mark the backend unreachable when it is a
    /// transport error.
    pub async fn observe(&self, err: &BackendError) {
        if err.is_unavailable() {
            self.mark_unreachable().await;
        }
    }

    async fn probe_locked(&self) -> Result<()> {
        self.inner.write().await.state = ProbeState::Probing;
        debug!(mode = %self.mode, "Probing plugin readiness");

        match self.check().await {
            Ok(backend) => {
                self.stats.record_attempt(true);
                let mut inner = self.inner.write().await;
                if backend.is_some() {
                    metrics::set_backend_connected(true);
                }
                inner.backend = backend;
                inner.state = ProbeState::Ready;
                info!(mode = %self.mode, "Probe succeeded");
                Ok(())
            }
            Err(e) => {
                self.stats.record_attempt(false);
                let mut inner = self.inner.write().await;
                if inner.backend.take().is_some() {
                    metrics::set_backend_connected(false);
                }
                inner.state = ProbeState::Unreachable;
                error!(mode = %self.mode, error = %e, "Probe failed");
                Err(e)
            }
        }
    }

    async fn check(&self) -> Result<Option<Arc<dyn StorageBackend>>> {
        if self.mode.runs_node() && self.node_id.is_empty() {
            return Err(CsiError::failed_precondition("node id is not configured"));
        }

        if !self.mode.runs_controller() {
            return Ok(None);
        }

        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| CsiError::failed_precondition("no backend is configured"))?;

        let backend = connector.connect().await.map_err(|e| {
            CsiError::failed_precondition(format!("unable to connect to the cluster: {}", e))
        })?;
        Ok(Some(backend))
    }
}
