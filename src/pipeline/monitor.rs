use super::work::ApiWorkManager;
use crate::domain::{HistoryItem, Record, RecordPayload, StatsRecord};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Internal producer that submits records through the loopback path.
pub trait EventSource: Send + 'static {
    fn name(&self) -> &'static str;

    /// Produces records until `stop` fires or the work manager stops
    /// accepting them.
    fn run(self, sink: ApiWorkManager, stop: CancellationToken) -> impl Future<Output = ()> + Send;
}

/// Periodically reports process uptime as a stats record.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    started: Instant,
    host: String,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            interval,
            started: Instant::now(),
            host,
        }
    }

    fn sample(&self) -> Record {
        let uptime = self.started.elapsed().as_secs_f64();
        Record::new(RecordPayload::Stats(StatsRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            items: vec![
                HistoryItem {
                    key: "uptime_secs".to_string(),
                    value_json: format!("{uptime:.3}"),
                },
                HistoryItem {
                    key: "host".to_string(),
                    value_json: serde_json::Value::String(self.host.clone()).to_string(),
                },
            ],
        }))
    }
}

impl EventSource for HeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn run(self, sink: ApiWorkManager, stop: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let done = sink.done_token();

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = done.cancelled() => break,
                _ = ticker.tick() => {
                    if !sink.add_work(self.sample()).await {
                        break;
                    }
                }
            }
        }
        debug!(source = self.name(), "Event source stopped");
    }
}
