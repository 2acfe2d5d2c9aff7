//! Protocol cryptography for platform callbacks.

pub mod cipher;
pub mod signature;

pub use cipher::PayloadCipher;
pub use signature::{compute_signature, verify_signature, SignatureVerifier};
