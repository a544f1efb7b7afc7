use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use crate::collector::Collector;
use crate::metrics::{EVENTS_FORWARDED, FORWARD_FAILURES, FORWARD_LATENCY};
use crate::models::QueuedEvent;
use crate::rate_limit::AdmissionController;

pub const QUEUE_CAPACITY: usize = 1024;

// Background worker -> forwards queued events one by one
pub async fn event_worker(mut rx: mpsc::Receiver<QueuedEvent>, collector: Collector) {
    if collector.is_configured() {
        tracing::info!(url = %collector.config().url, "event worker started");
    } else {
        tracing::info!("event worker started without collector credentials, events will be dropped");
    }

    while let Some(queued) = rx.recv().await {
        let start = Instant::now();
        match collector.send(&queued).await {
            Ok(true) => {
                EVENTS_FORWARDED.inc();
                FORWARD_LATENCY.observe(start.elapsed().as_secs_f64());
                tracing::debug!(event = %queued.event.event_name, "event forwarded");
            }
            Ok(false) => {
                tracing::debug!(event = %queued.event.event_name, "collector not configured, event dropped");
            }
            // The visitor already got their response; failures only get logged.
            Err(e) => {
                FORWARD_FAILURES.inc();
                tracing::error!(event = %queued.event.event_name, error = %e, "failed to forward event");
            }
        }
    }

    tracing::info!("event queue closed, worker exiting");
}

// Full expiry sweep of the rate table on a fixed interval
pub async fn rate_table_sweeper(limiter: Arc<AdmissionController>, every: Duration) {
    let mut interval = interval(every);
    // the first tick fires immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let removed = limiter.sweep_expired(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, tracked = limiter.len(), "swept expired rate windows");
        }
    }
}
