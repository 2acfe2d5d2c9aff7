//! Callback ingress and HTTP surface for courier.
//!
//! Verifies and decrypts platform callbacks, routes parsed messages to
//! registered handlers, and exposes health and queue endpoints.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_api::{handler_fn, MessageRouter};
//! use courier_core::{OutboundMessage, ParsedMessage, Target};
//!
//! let mut router = MessageRouter::new();
//! router.register(
//!     "text",
//!     handler_fn(|message: ParsedMessage, _| async move {
//!         let reply = format!("received: {}", message.text().unwrap_or_default());
//!         Ok(Some(OutboundMessage::text(Target::user(message.from_user), reply)))
//!     }),
//! );
//! let router = Arc::new(router);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::SharedClock;
use courier_delivery::{DeliveryQueue, HealthMonitor};

pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod router;
pub mod server;

pub use app::Services;
pub use config::{Config, TenantSettings};
pub use crypto::{PayloadCipher, SignatureVerifier};
pub use error::{CallbackError, ErrorBody};
pub use processor::{Acknowledgement, CallbackProcessor, CallbackQuery};
pub use router::{handler_fn, CallbackContext, MessageFilter, MessageHandler, MessageRouter, Route, RouteOutcome};
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Callback pipeline
    pub processor: Arc<CallbackProcessor>,
    /// Outbound delivery queue
    pub queue: DeliveryQueue,
    /// Health probes and latest report
    pub health: Arc<HealthMonitor>,
    /// Clock for response timestamps
    pub clock: SharedClock,
}
