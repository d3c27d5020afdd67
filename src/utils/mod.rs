//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics, and timing.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 sealing and the asynchronous `FrameCipher` seam
//! - **Logging**: `tracing-subscriber` installation from configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Timeout constants and async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure nonces (getrandom)
//! - Key material zeroed after use (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crypto::{ChaChaCipher, FrameCipher};
pub use metrics::{Metrics, MetricsSnapshot};
