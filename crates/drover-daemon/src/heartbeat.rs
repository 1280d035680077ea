use std::sync::Arc;

use drover_core::types::DaemonState;
use drover_harness::health::HealthRegistry;
use drover_store::Store;
use tracing::warn;

/// Writes the liveness singleton from the loop-health registry.
///
/// A loop that misses twice its interval degrades the daemon state; the
/// record also carries the first in-progress ticket so operators can see
/// what the fleet is chewing on.
pub struct Heartbeat {
    health: Arc<HealthRegistry>,
}

impl Heartbeat {
    pub fn new(health: Arc<HealthRegistry>) -> Self {
        Self { health }
    }

    pub async fn beat(&self, store: &Store) -> Result<DaemonState, drover_store::StoreError> {
        let stale = self.health.stale_loops();
        let state = if stale.is_empty() {
            DaemonState::Running
        } else {
            for lagging in &stale {
                warn!(
                    name = lagging.name,
                    stale_for_secs = lagging.since.as_secs(),
                    "loop missed its heartbeat window"
                );
            }
            DaemonState::Degraded
        };

        let current_ticket = store
            .tickets_in_progress()
            .await?
            .first()
            .map(|ticket| ticket.id);
        store.update_daemon_status(state, current_ticket).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_core::clock::ManualClock;
    use drover_core::types::{NewProject, NewTicket};
    use std::time::Duration;

    #[tokio::test]
    async fn healthy_loops_write_running() {
        let clock = ManualClock::new(Utc::now());
        let store = Store::new_in_memory(Arc::new(clock)).await.unwrap();
        let health = Arc::new(HealthRegistry::new());
        health.register("scheduler", Duration::from_secs(60));

        let state = Heartbeat::new(health).beat(&store).await.unwrap();
        assert_eq!(state, DaemonState::Running);

        let status = store.get_daemon_status().await.unwrap().unwrap();
        assert_eq!(status.state, DaemonState::Running);
        assert_eq!(status.current_ticket_id, None);
    }

    #[tokio::test]
    async fn stale_loop_degrades_and_current_ticket_is_recorded() {
        let clock = ManualClock::new(Utc::now());
        let store = Store::new_in_memory(Arc::new(clock)).await.unwrap();
        let project = store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        let ticket = store
            .create_ticket(NewTicket::new(project.id, "t"))
            .await
            .unwrap();
        store.claim_ticket(ticket.id).await.unwrap();

        let health = Arc::new(HealthRegistry::new());
        health.register("watchdog", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = Heartbeat::new(health).beat(&store).await.unwrap();
        assert_eq!(state, DaemonState::Degraded);

        let status = store.get_daemon_status().await.unwrap().unwrap();
        assert_eq!(status.current_ticket_id, Some(ticket.id));
    }
}
