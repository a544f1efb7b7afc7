mod analytics;
mod health;
mod metrics;

pub use analytics::{MAX_BODY_BYTES, analytics_handler};
pub use health::health_handler;
pub use metrics::metrics_handler;
