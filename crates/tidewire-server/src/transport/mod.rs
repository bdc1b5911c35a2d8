//! Network ingress: the WebSocket stream transport, the HTTP POST fallback
//! and the token refresh endpoint.

pub mod http;
pub mod stream;

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, HeaderName};
use tidewire_common::{RateLimiter, TidewireConfig, TokenAuthenticator};

use crate::registry::MethodRegistry;

/// Sub-protocol selected for stream connections. It contains no `.`, so it
/// can never be mistaken for a token.
pub const SUBPROTOCOL: &str = "tidewire-v1";

/// Header carrying the token on HTTP fallback requests.
pub const TOKEN_HEADER: HeaderName = HeaderName::from_static("x-tidewire-token");

/// Header a caller must send to obtain a fresh token.
pub const REFRESH_HEADER: HeaderName = HeaderName::from_static("x-tidewire-refresh");

/// State shared by every transport handler.
#[derive(Clone)]
pub struct TransportState {
    pub registry: Arc<MethodRegistry>,
    pub auth: Arc<TokenAuthenticator>,
    pub limiter: RateLimiter,
    pub config: Arc<TidewireConfig>,
}

/// Resolves the caller's address.
///
/// With `trusted_proxy_hops == 0` this is the socket peer. Otherwise the
/// `X-Forwarded-For` entry `hops` positions from the right is used, falling
/// back to the leftmost entry when the chain is shorter, and to the peer when
/// the header is absent or unparseable.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_proxy_hops: usize) -> IpAddr {
    if trusted_proxy_hops == 0 {
        return peer.ip();
    }

    let chain: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|entry| entry.trim().parse().ok())
        .collect();

    chain
        .len()
        .checked_sub(trusted_proxy_hops)
        .and_then(|i| chain.get(i))
        .or_else(|| chain.first())
        .copied()
        .unwrap_or_else(|| peer.ip())
}

fn offered_protocols(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
}

/// The token offered as a WebSocket sub-protocol: the entry containing a `.`.
pub(crate) fn offered_token(headers: &HeaderMap) -> Option<String> {
    offered_protocols(headers)
        .find(|p| p.contains('.'))
        .map(str::to_string)
}

/// The sub-protocol to answer the upgrade with. Clients must always get one
/// of their offers back, so a client that offered only its token gets the
/// token echoed.
pub(crate) fn selected_protocol(headers: &HeaderMap, token: String) -> Cow<'static, str> {
    if offered_protocols(headers).any(|p| p == SUBPROTOCOL) {
        Cow::Borrowed(SUBPROTOCOL)
    } else {
        Cow::Owned(token)
    }
}
