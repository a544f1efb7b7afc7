use analytics_relay::{
    AppState,
    collector::{Collector, CollectorConfig},
    config::Args,
    rate_limit::AdmissionController,
    router,
    worker::{QUEUE_CAPACITY, event_worker, rate_table_sweeper},
};
use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();
    if let Err(e) = args.validate() {
        tracing::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    let limiter = Arc::new(AdmissionController::new(args.rate_limit_config()));
    let (event_tx, event_rx) = mpsc::channel(QUEUE_CAPACITY);

    let state = Arc::new(AppState {
        limiter: Arc::clone(&limiter),
        limits: args.limits(),
        resolver: args.resolver()?,
        site_origin: args.site_origin.clone(),
        event_tx,
    });

    // spawn the background workers
    let collector = Collector::new(
        reqwest::Client::new(),
        CollectorConfig {
            url: args.collector_url.clone(),
            measurement_id: args.measurement_id.clone(),
            api_secret: args.api_secret.clone(),
            enabled: args.analytics_enabled,
            forward_client_ip: args.forward_client_ip,
            forward_user_agent: args.forward_user_agent,
        },
    );
    let worker = tokio::spawn(event_worker(event_rx, collector));
    tokio::spawn(rate_table_sweeper(limiter, args.sweep_interval()));

    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Analytics relay listening on {}", addr);
    tracing::info!(
        "Rate limit: {} requests per {} seconds ({} for unidentified clients), tracking at most {} clients",
        args.rate_limit,
        args.rate_window,
        args.unknown_rate_limit,
        args.max_tracked_clients
    );
    if args.trust_proxy {
        tracing::info!("Trusting client IP headers: {}", args.ip_headers.join(", "));
    }
    if args.site_origin.is_none() {
        tracing::warn!("SITE_ORIGIN not set, origin checks only log");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;

    // Router (and with it the last queue sender) is gone; let the worker drain.
    let _ = worker.await;
    Ok(())
}
