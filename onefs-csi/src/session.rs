//! Process-wide service state shared by the Identity, Controller and Node
//! services.

use std::sync::Arc;

use tracing::info;

use crate::backend::{BackendConnector, BackendError, StorageBackend};
use crate::config::DriverConfig;
use crate::error::Result;
use crate::probe::{ProbeState, ProbeStatsSnapshot, ProbeSupervisor};
use crate::types::ServiceMode;

/// Emit a statistics line every this many auto-probe calls.
const STATISTICS_INTERVAL: u64 = 100;

pub struct Session {
    config: DriverConfig,
    supervisor: ProbeSupervisor,
}

impl Session {
    pub fn new(config: DriverConfig, connector: Option<Arc<dyn BackendConnector>>) -> Self {
        let supervisor = ProbeSupervisor::new(
            connector,
            config.mode,
            config.node_id.clone(),
            config.auto_probe,
        );
        Self { config, supervisor }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn mode(&self) -> ServiceMode {
        self.config.mode
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn node_ip(&self) -> Option<&str> {
        self.config.node_ip.as_deref()
    }

    pub async fn state(&self) -> ProbeState {
        self.supervisor.state().await
    }

    /// Synchronous readiness probe.
    pub async fn probe(&self) -> Result<()> {
        self.supervisor.probe().await
    }

    /// Readiness gate run at the top of every data operation.
    pub async fn auto_probe(&self) -> Result<()> {
        let calls = self.supervisor.stats().record_auto_probe();
        if calls % STATISTICS_INTERVAL == 0 {
            self.log_statistics();
        }
        self.supervisor.auto_probe().await
    }

    /// Connected backend after the auto-probe gate.
    pub async fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        self.auto_probe().await?;
        self.supervisor.backend().await
    }

    /// Report a backend failure so transport errors drop the connection.
    pub async fn backend_failed(&self, err: &BackendError) {
        self.supervisor.observe(err).await;
    }

    pub fn statistics(&self) -> ProbeStatsSnapshot {
        self.supervisor.stats().snapshot()
    }

    pub fn log_statistics(&self) {
        let stats = self.statistics();
        info!(
            probe_attempts = stats.probe_attempts,
            probe_failures = stats.probe_failures,
            auto_probe_calls = stats.auto_probe_calls,
            "Session statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryConnector};

    fn session(auto_probe: bool) -> (Session, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = DriverConfig {
            node_id: "node-a".to_string(),
            auto_probe,
            ..Default::default()
        };
        let connector: Arc<dyn BackendConnector> = Arc::new(MemoryConnector::new(backend.clone()));
        (Session::new(config, Some(connector)), backend)
    }

    #[tokio::test]
    async fn test_backend_counts_auto_probe() {
        let (session, _) = session(true);
        assert!(session.backend().await.is_ok());
        assert!(session.backend().await.is_ok());

        let stats = session.statistics();
        assert_eq!(stats.auto_probe_calls, 2);
        assert_eq!(stats.probe_attempts, 1);
        assert_eq!(session.state().await, ProbeState::Ready);
    }

    #[tokio::test]
    async fn test_statistics_logged_periodically() {
        let (session, _) = session(true);
        for _ in 0..STATISTICS_INTERVAL {
            session.auto_probe().await.unwrap();
        }
        assert_eq!(session.statistics().auto_probe_calls, STATISTICS_INTERVAL);
    }

    #[tokio::test]
    async fn test_accessors() {
        let (session, _) = session(false);
        assert_eq!(session.node_id(), "node-a");
        assert_eq!(session.node_ip(), None);
        assert_eq!(session.mode(), ServiceMode::All);
        assert!(session.backend().await.is_err());
    }
}
