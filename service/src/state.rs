//! Shared daemon state: the engine plus connection bookkeeping for the
//! idle timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tapedeck_core::Orchestrator;
use tokio::sync::Mutex;

pub struct ServiceState {
    orchestrator: Orchestrator,
    /// Last time a request was handled, for idle timeout tracking.
    last_activity: Arc<Mutex<Instant>>,
    /// Active connection count for idle timeout tracking.
    connection_count: Arc<AtomicU32>,
}

impl ServiceState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let now = Instant::now();
        Self {
            orchestrator,
            last_activity: Arc::new(Mutex::new(now)),
            connection_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn uptime_s(&self) -> u64 {
        self.orchestrator.uptime().as_secs()
    }

    /// Record activity (resets the idle timer).
    pub async fn touch_activity(&self) {
        let mut ts = self.last_activity.lock().await;
        *ts = Instant::now();
    }

    pub async fn last_activity_elapsed(&self) -> Duration {
        let ts = self.last_activity.lock().await;
        ts.elapsed()
    }

    pub fn inc_connections(&self) -> u32 {
        self.connection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec_connections(&self) -> u32 {
        self.connection_count
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// No clients, no capture, no queued or running work, and no request
    /// for at least `timeout`.
    pub async fn is_idle_for(&self, timeout: Duration) -> bool {
        self.connection_count() == 0
            && self.orchestrator.is_idle()
            && self.last_activity_elapsed().await >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapedeck_core::config::AppConfig;

    fn state(root: &std::path::Path) -> ServiceState {
        let mut config = AppConfig::default();
        config.paths.import_root = root.join("import");
        config.paths.library_root = root.join("library");
        ServiceState::new(Orchestrator::new(config))
    }

    #[tokio::test]
    async fn connections_keep_the_service_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        assert!(state.is_idle_for(Duration::ZERO).await);

        assert_eq!(state.inc_connections(), 1);
        assert!(!state.is_idle_for(Duration::ZERO).await);
        assert_eq!(state.dec_connections(), 0);
        assert!(state.is_idle_for(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn recent_activity_defers_idle_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());
        state.touch_activity().await;
        assert!(!state.is_idle_for(Duration::from_secs(60)).await);
    }
}
