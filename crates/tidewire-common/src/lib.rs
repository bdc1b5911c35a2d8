//! tidewire Common Types
//!
//! Shared building blocks for the tidewire RPC transport and session layer:
//!
//! - [`protocol`] - Request/response types and the crate-wide error enum
//! - [`codec`] - JSON and MessagePack wire codecs
//! - [`value`] / [`serializer`] - Handler result graphs and their safe
//!   preparation for encoding
//! - [`token`] - Short-lived HMAC handshake tokens
//! - [`rate_limit`] - Per-IP connection caps and per-connection message windows
//! - [`config`] - Server configuration loading and validation
//!
//! # Example
//!
//! ```
//! use tidewire_common::{RequestId, RpcResponse, RpcStats, RpcValue, Serializer};
//!
//! let result = RpcValue::object([("x", RpcValue::from(1))]);
//! let prepared = Serializer::new().prepare(&result);
//! let response = RpcResponse::success(RequestId::from("1"), prepared, RpcStats::unlimited());
//! assert!(response.ok);
//! ```

pub mod codec;
pub mod config;
pub mod protocol;
pub mod rate_limit;
pub mod serializer;
pub mod time;
pub mod token;
pub mod value;

pub use codec::Codec;
pub use config::TidewireConfig;
pub use protocol::*;
pub use rate_limit::{ConnectionId, RateLimitConfig, RateLimitResult, RateLimiter};
pub use serializer::Serializer;
pub use token::{SecretSource, TokenAuthenticator, TokenConfig};
pub use value::{ArrayRef, ObjectRef, RpcValue, Serializable};
