//! # Core Wire Components
//!
//! Low-level framing, codecs, and typed binary serialization.
//!
//! ## Components
//! - **Packer / Unpacker**: typed big-endian payload encoding
//! - **Frame**: one length-delimited, optionally encrypted unit of wire data
//! - **Codec**: Tokio codec extracting frames from a byte stream
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [Encrypted(1)] [Payload(Length)]
//! ```
//!
//! ## Safety Limits
//! - Maximum payload size is enforced before allocation
//! - The encryption flag must be exactly 0 or 1

pub mod codec;
pub mod frame;
pub mod packer;
