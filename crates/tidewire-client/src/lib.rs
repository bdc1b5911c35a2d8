//! tidewire Client
//!
//! - [`RpcClient`] talks to the HTTP fallback, fetching and caching a
//!   handshake token from the refresh endpoint.
//! - [`StreamClient`] holds a WebSocket stream open and correlates replies
//!   to calls by request id.

pub mod client;
pub mod stream;

pub use client::RpcClient;
pub use stream::StreamClient;

use tidewire_common::{Result, RpcResponse, TidewireError};

/// Unwraps a response into its result, turning `ok: false` into an error.
pub fn into_result(response: RpcResponse) -> Result<rmpv::Value> {
    if response.ok {
        Ok(response.result.unwrap_or(rmpv::Value::Nil))
    } else {
        Err(TidewireError::Handler(
            response.error.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}
