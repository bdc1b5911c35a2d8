//! tidewire Server
//!
//! Method registry, middleware and network transports for the tidewire RPC
//! layer. Clients connect over a WebSocket stream, offering a handshake
//! token as a sub-protocol, or fall back to HTTP POST. Both paths share one
//! [`MethodRegistry`] and one [`RateLimiter`](tidewire_common::RateLimiter).

pub mod context;
pub mod middleware;
pub mod registry;
pub mod server;
pub mod transport;

pub use context::{ConnectionContext, Context, TransportKind};
pub use middleware::{from_fn, ChainOutcome, Middleware, MiddlewareContext, Next, RequestKind};
pub use registry::{Handler, MethodDefinition, MethodRegistry, Reply};
pub use server::RpcServer;
pub use transport::{client_ip, TransportState, REFRESH_HEADER, SUBPROTOCOL, TOKEN_HEADER};
