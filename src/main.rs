//! Courier messaging gateway.
//!
//! Main entry point: loads configuration, wires the delivery and callback
//! components, serves HTTP, and drains the delivery queue on shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{handler_fn, Config, MessageRouter, Services};
use courier_core::{ParsedMessage, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long in-flight sends may take to finish after shutdown begins.
const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting courier messaging gateway");

    let config = Config::load()?;
    let addr = config.parse_server_addr()?;
    info!(
        server_addr = %addr,
        tenants = config.tenants.len(),
        default_tenant = %config.default_tenant,
        platform = %config.platform_base_url,
        "Configuration loaded"
    );

    let services =
        Services::build(&config, default_router(), RealClock::shared()).context("failed to build services")?;

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(Arc::clone(services.health()).run(config.health_check_interval(), cancel.clone()));

    info!(addr = %addr, "courier is ready to receive callbacks");
    if let Err(e) = courier_api::start_server(services.http_router(), addr).await {
        error!(error = %e, "Server failed");
    }

    cancel.cancel();
    if monitor.await.is_err() {
        warn!("health monitor task panicked");
    }

    let status = services.queue().status();
    info!(pending = status.pending, in_flight = status.in_flight, "Draining delivery queue");
    if !services.queue().shutdown(QUEUE_DRAIN_TIMEOUT).await {
        warn!(timeout_secs = QUEUE_DRAIN_TIMEOUT.as_secs(), "Delivery queue did not drain before timeout");
    }
    let dead_letters = services.queue().dead_letters().len();
    if dead_letters > 0 {
        warn!(dead_letters, "Dead letters discarded at shutdown");
    }

    info!("courier shutdown complete");
    Ok(())
}

/// Logs every inbound message; applications replace this with their own
/// handlers.
fn default_router() -> MessageRouter {
    let mut router = MessageRouter::new();
    router.set_default(handler_fn(|message: ParsedMessage, context| async move {
        info!(
            account = %context.account_id,
            msg_type = %message.msg_type,
            event = message.event().unwrap_or_default(),
            from_user = %message.from_user,
            "callback received"
        );
        Ok(None)
    }));
    router
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
