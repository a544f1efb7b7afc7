use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("analytics_requests_total", "Total number of analytics requests").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("analytics_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref EVENTS_FORWARDED: Counter =
        register_counter!("analytics_events_forwarded_total", "Events accepted by the collector").unwrap();
    pub static ref FORWARD_FAILURES: Counter =
        register_counter!("analytics_forward_failures_total", "Events the collector failed to accept").unwrap();
    pub static ref RATE_TABLE_EVICTIONS: Counter = register_counter!(
        "analytics_rate_table_evictions_total",
        "Live rate limit windows evicted to respect the table cap"
    )
    .unwrap();
    pub static ref TRACKED_CLIENTS: Gauge =
        register_gauge!("analytics_tracked_clients", "Current number of rate limit windows").unwrap();
    pub static ref FORWARD_LATENCY: Histogram = register_histogram!(
        "analytics_forward_latency_seconds",
        "Collector round trip in seconds"
    )
    .unwrap();
}
