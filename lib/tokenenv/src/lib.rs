//! Ephemeral PKCS#11 token environments for certificate-toolkit testing
//!
//! Provisions throwaway SoftHSM2 tokens with isolated configuration and
//! storage, generates keys inside them, and drives a certificate toolkit
//! against locator references to those keys. All cryptography happens in the
//! external tools; this crate orchestrates processes and checks their output.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod error;
pub mod exec;
pub mod scenario;
pub mod token;
pub mod toolkit;
pub mod verify;

pub use error::TokenError;
pub use exec::{ExecOutput, Invocation, DEFAULT_TIMEOUT};
pub use scenario::Scenario;
pub use token::{KeyHandle, TokenEnvironment};
pub use toolkit::{CertToolkit, CsrOptions};
