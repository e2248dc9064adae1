use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::MIN_INGEST_INTERVAL_SECS;
use crate::engine::Engine;

/// Fires one engine cycle per interval. The first cycle runs immediately.
/// A cycle that overruns the interval delays the next tick instead of
/// queueing a burst.
pub struct CycleScheduler {
    engine: Arc<Engine>,
    period: Duration,
}

impl CycleScheduler {
    pub fn new(engine: Arc<Engine>, interval_secs: u64) -> Self {
        Self {
            engine,
            period: Duration::from_secs(interval_secs.max(MIN_INGEST_INTERVAL_SECS)),
        }
    }

    pub async fn run(self) {
        info!("[SCHEDULER] cycle every {}s", self.period.as_secs());
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // run_cycle logs its own summary
            if let Err(e) = self.engine.run_cycle(Utc::now()).await {
                error!("[SCHEDULER] cycle error: {e}");
            }
        }
    }
}
