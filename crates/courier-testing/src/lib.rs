//! Shared test infrastructure for courier crates.
//!
//! - [`fixtures`]: deterministic tenant configuration
//! - [`callback`]: platform-style signed and encrypted callback requests
//! - [`platform`]: wiremock stand-in for the platform API

pub mod callback;
pub mod fixtures;
pub mod platform;

pub use callback::{CallbackBuilder, SignedCallback};
pub use fixtures::{config, directory, TenantBuilder, TEST_AES_KEY, TEST_TOKEN};
pub use platform::MockPlatform;
