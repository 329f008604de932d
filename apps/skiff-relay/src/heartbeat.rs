use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::registry::SessionRegistry;

/// Ping every session once per `period`; a session that has not answered the
/// previous ping by the next tick is terminated. This is the relay's only
/// liveness check.
pub fn spawn_heartbeat(registry: Arc<SessionRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.sweep();
            debug!(
                reaped = reaped.len(),
                live = registry.len(),
                "heartbeat tick"
            );
        }
    })
}
