//! HTTP POST fallback and token refresh endpoints.
//!
//! The fallback serves clients that cannot hold a stream open. Requests are
//! processed in this order:
//!
//! 1. token check (`x-tidewire-token`), 401 on failure
//! 2. middleware with an HTTP context, 403 when it blocks
//! 3. body size check, 413 when `Content-Length` or the streamed body
//!    exceeds the cap
//! 4. decoding by `Content-Type`, 400 when the body is not a request
//! 5. dispatch through the registry and encoding with the request's codec
//!
//! Fallback requests have no connection, so their stats always report the
//! unlimited sentinel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::json;
use tracing::{debug, error, warn};

use tidewire_common::{Codec, TidewireError};

use super::{client_ip, TransportState, REFRESH_HEADER, TOKEN_HEADER};
use crate::context::{ConnectionContext, Context};
use crate::middleware::{run_chain, ChainOutcome, MiddlewareContext};

/// Handles `POST <http path>`.
pub(crate) async fn http_handler(
    State(state): State<TransportState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let ip = client_ip(request.headers(), peer, state.config.trusted_proxy_hops);

    let token = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !token.is_some_and(|t| state.auth.verify(t)) {
        warn!(%ip, "HTTP request rejected: missing or invalid token");
        let err = TidewireError::Auth("missing or invalid token".into());
        return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    let conn = ConnectionContext::http(Some(ip));
    let mctx = MiddlewareContext::http(
        Context::new(conn),
        request.method().as_str(),
        request.uri().path(),
    );

    let slot: Arc<Mutex<Option<Response>>> = Arc::new(Mutex::new(None));
    let response_slot = slot.clone();
    let middleware = state.registry.middleware().await;

    // The middleware wraps the whole request once; the registry does not
    // run it again per method.
    let outcome = run_chain(middleware, mctx, move |ctx| {
        Box::pin(async move {
            let response = process(state, ctx, request).await;
            *response_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
            Ok(())
        })
    })
    .await;

    let response = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    match (outcome, response) {
        (ChainOutcome::Completed, Some(response)) => response,
        (ChainOutcome::Blocked, _) | (ChainOutcome::Completed, None) => {
            debug!(%ip, "HTTP request blocked by middleware");
            (StatusCode::FORBIDDEN, TidewireError::MiddlewareBlocked.to_string()).into_response()
        }
        (ChainOutcome::Failed(message), _) => {
            debug!(%ip, "HTTP request failed in middleware: {}", message);
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

async fn process(state: TransportState, ctx: Context, request: Request) -> Response {
    let max_body_size = state.config.max_body_size;
    let (parts, body) = request.into_parts();

    if declared_length(&parts.headers).is_some_and(|len| len > max_body_size) {
        return payload_too_large(max_body_size);
    }

    let bytes = match read_body(body, max_body_size).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let codec = Codec::from_content_type(
        parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );

    let frame = match codec.decode_frame(&bytes) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Undecodable HTTP body: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let reply = state.registry.dispatch_intercepted_frame(frame, &ctx).await;
    match reply.encode(codec) {
        Ok(encoded) => (
            [(CONTENT_TYPE, HeaderValue::from_static(codec.content_type()))],
            encoded,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode HTTP reply: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, Response> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(payload_too_large(limit)),
        Err(e) => {
            debug!("Failed to read HTTP body: {}", e);
            Err((StatusCode::BAD_REQUEST, format!("Failed to read body: {e}")).into_response())
        }
    }
}

fn payload_too_large(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("Request body exceeds {limit} bytes"),
    )
        .into_response()
}

/// Handles `POST <token path>`: issues a fresh token.
///
/// The refresh header cannot be set by a plain cross-site form post, so its
/// presence is required.
pub(crate) async fn token_handler(State(state): State<TransportState>, headers: HeaderMap) -> Response {
    if !headers.contains_key(REFRESH_HEADER) {
        debug!("Token refresh without {} header", REFRESH_HEADER);
        return (StatusCode::FORBIDDEN, "Missing refresh header").into_response();
    }

    Json(json!({
        "token": state.auth.generate(),
        "expiresInMs": state.auth.config().validity_ms,
    }))
    .into_response()
}

pub(crate) async fn health_handler() -> &'static str {
    "OK"
}
