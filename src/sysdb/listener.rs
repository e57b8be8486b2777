//! Notification listener: a long-lived `LISTEN` connection fanning out to
//! in-process condition variables. The database row is always the source
//! of truth — this is a wake-up optimization, never a delivery guarantee.

use std::time::Duration;

use sqlx::postgres::PgListener;
use tracing::{debug, error, instrument, warn};

use super::SystemDatabase;

const NOTIFICATIONS_CHANNEL: &str = "dbos_notifications_channel";
const WORKFLOW_EVENTS_CHANNEL: &str = "dbos_workflow_events_channel";

impl SystemDatabase {
    /// Spawn the listener loop. Reconnects with a 1s backoff on any error;
    /// waiters always re-probe the database after waking, so a dropped or
    /// duplicated notification is harmless.
    pub fn spawn_notification_listener(
        &self,
        database_url: String,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match db.run_listener(&database_url, &mut shutdown).await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(error = %e, "notification listener failed, reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    #[instrument(skip(self, shutdown))]
    async fn run_listener(
        &self,
        database_url: &str,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect(database_url).await?;
        listener
            .listen_all([NOTIFICATIONS_CHANNEL, WORKFLOW_EVENTS_CHANNEL])
            .await?;

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    self.route_notification(notification.channel(), notification.payload());
                }
                _ = tokio::time::sleep(Duration::from_secs(60)) => {
                    // Periodic wakeup, matching the source's 60s poll timeout.
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn route_notification(&self, channel: &str, payload: &str) {
        let map = match channel {
            NOTIFICATIONS_CHANNEL => &self.inner.notifications_map,
            WORKFLOW_EVENTS_CHANNEL => &self.inner.workflow_events_map,
            other => {
                warn!(channel = other, "unknown notification channel");
                return;
            }
        };

        if let Some(notify) = map.get(payload) {
            notify.notify_waiters();
            debug!(%payload, "woke waiter");
        }
    }
}
