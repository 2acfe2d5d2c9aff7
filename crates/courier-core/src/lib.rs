//! Core domain types for the courier messaging gateway.
//!
//! Provides the error taxonomy, clock abstraction, tenant and outbound
//! message models, inbound message parsing, and delivery events shared by
//! the delivery and API crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod message;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{DeliveryEvent, DeliveryObserver, MulticastObserver, NoOpObserver};
pub use message::{MessageContent, ParsedMessage};
pub use models::{
    Article, Credential, DeadLetter, MediaKind, MessageBody, OutboundMessage, QueuedSend, SendReceipt,
    StaticTenantDirectory, TaskId, Target, TenantConfig, TenantDirectory, TenantKey,
};
pub use time::{Clock, RealClock, SharedClock, TestClock};
