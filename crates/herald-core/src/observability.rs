//! Observability surface.
//!
//! Counters and histograms are emitted inline where things happen (see
//! the broker, workers, cache, and rate limiter); this module installs
//! the Prometheus recorder and samples the gauges that need polling.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tracing::debug;

use crate::broker::Broker;
use crate::notification::Channel;
use crate::{Error, Result};

/// Install the global Prometheus recorder. The returned handle renders
/// the scrape body for `/actuator/prometheus`.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {}", e)))
}

/// Periodically sample per-channel queue depths into gauges.
pub fn spawn_queue_depth_sampler(
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = ticker.tick() => {
                    for channel in Channel::ALL {
                        let queue = broker.channel_queue(channel).to_string();
                        match broker.queue_depth(&queue).await {
                            Ok(depth) => {
                                metrics::gauge!("queue.depth", "channel" => channel.as_str())
                                    .set(depth as f64);
                            }
                            Err(e) => debug!(queue = %queue, error = %e, "Queue depth sample failed"),
                        }
                    }
                }
            }
        }
    })
}
