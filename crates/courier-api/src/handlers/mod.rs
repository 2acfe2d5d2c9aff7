//! HTTP request handlers.
//!
//! - `callback` - platform URL verification and message callbacks
//! - `health` - health report, readiness and liveness probes
//! - `queue` - delivery queue status and dead letters
//!
//! Callback rejections use the `{errcode, errmsg}` body from
//! [`crate::error::CallbackError`].

pub mod callback;
pub mod health;
pub mod queue;

pub use callback::{method_not_allowed, receive_account, receive_default, verify_account, verify_default};
pub use health::{health_check, liveness_check, readiness_check};
pub use queue::{dead_letters, queue_status};
