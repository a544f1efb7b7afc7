use std::sync::Arc;
use tokio::sync::mpsc;
use crate::client_ip::{ClientIpResolver, RateLimits};
use crate::models::QueuedEvent;
use crate::rate_limit::AdmissionController;
// app's shared state

pub struct AppState {
    pub limiter: Arc<AdmissionController>,
    pub limits: RateLimits,
    pub resolver: ClientIpResolver,
    pub site_origin: Option<String>, // expected origin of the site, if enforced
    pub event_tx: mpsc::Sender<QueuedEvent>,
}
