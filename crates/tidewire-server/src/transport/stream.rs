//! WebSocket stream transport.
//!
//! # Connection lifecycle
//!
//! 1. **Connecting**: the upgrade request is checked. The token must be
//!    offered as a `Sec-WebSocket-Protocol` entry, and the caller's address
//!    must be under its connection cap. Failures answer 401 or 429 and the
//!    connection is never tracked.
//! 2. **Authenticated**: the connection is tracked and the upgrade proceeds.
//! 3. **Open**: frames are admitted one at a time in arrival order. Each
//!    admitted frame is dispatched on its own task and replies are funneled
//!    through a single writer task.
//! 4. **Closed**: the connection is untracked. Replies still in flight are
//!    dropped.
//!
//! Text frames carry JSON and binary frames carry MessagePack. A reply uses
//! the codec of the frame it answers.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tidewire_common::{Codec, ConnectionId, Frame, RateLimiter, RateLimitResult, TidewireError};

use super::{client_ip, offered_token, selected_protocol, TransportState};
use crate::context::ConnectionContext;
use crate::registry::{MethodRegistry, Reply};

/// Replies buffered for the writer task before dispatch tasks wait.
const WRITER_QUEUE: usize = 64;

/// Handles `GET <stream path>`.
pub(crate) async fn stream_handler(
    State(state): State<TransportState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let conn_id = ConnectionId::next();
    let ip = client_ip(&headers, peer, state.config.trusted_proxy_hops);
    debug!(%ip, "{} connecting", conn_id);

    let Some(token) = offered_token(&headers).filter(|token| state.auth.verify(token)) else {
        warn!(%ip, "{} rejected: missing or invalid token", conn_id);
        let err = TidewireError::Auth("missing or invalid token".into());
        return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    };
    let protocol = selected_protocol(&headers, token);

    if !state.limiter.track_connection(conn_id, ip).await {
        let err = TidewireError::Capacity(ip.to_string());
        return (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response();
    }
    debug!(%ip, "{} authenticated", conn_id);

    let max_frame_payload = state.config.max_frame_payload;
    // Frames between the payload cap and this ceiling are read and then
    // refused with a close frame; anything larger is cut off by the socket.
    let ceiling = max_frame_payload.saturating_mul(2);
    let failed_limiter = state.limiter.clone();

    ws.protocols([protocol])
        .max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_failed_upgrade(move |e| {
            warn!("{} upgrade failed: {}", conn_id, e);
            tokio::spawn(async move { failed_limiter.untrack_connection(conn_id).await });
        })
        .on_upgrade(move |socket| {
            let session = StreamSession {
                registry: state.registry,
                limiter: state.limiter,
                conn_id,
                ip,
                max_frame_payload,
            };
            session.run(socket)
        })
}

/// What to do with one inbound frame.
#[derive(Debug)]
pub(crate) enum Admission {
    Dispatch(Frame),
    /// Answer without dispatching, e.g. when the window is exhausted.
    Reply(Reply),
    Close(CloseFrame<'static>),
}

pub(crate) struct StreamSession {
    registry: Arc<MethodRegistry>,
    limiter: RateLimiter,
    conn_id: ConnectionId,
    ip: IpAddr,
    max_frame_payload: usize,
}

impl StreamSession {
    fn connection(&self) -> ConnectionContext {
        ConnectionContext::stream(self.conn_id, self.ip)
    }

    /// Applies the size cap, the rate limit and frame decoding, in that order.
    pub(crate) async fn admit(&self, codec: Codec, payload: &[u8]) -> Admission {
        if payload.len() > self.max_frame_payload {
            warn!(
                "{} sent {} byte frame (max {})",
                self.conn_id,
                payload.len(),
                self.max_frame_payload
            );
            return Admission::Close(close(close_code::SIZE, "Message too big"));
        }

        let verdict = self.limiter.check_rate_limit(self.conn_id).await;

        let frame = match codec.decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{} sent an undecodable frame: {}", self.conn_id, e);
                return Admission::Close(close(close_code::PROTOCOL, "Invalid frame"));
            }
        };

        if let RateLimitResult::RateLimited { retry_after } = verdict {
            debug!(
                "{} rate limited for {:?} ({} requests refused)",
                self.conn_id,
                retry_after,
                frame.len()
            );
            let stats = self.limiter.rpc_stats(self.conn_id).await;
            return Admission::Reply(Reply::error_for(
                frame.ids(),
                frame.is_batch(),
                &TidewireError::RateLimited.to_string(),
                stats,
            ));
        }

        Admission::Dispatch(frame)
    }

    async fn run(self, socket: WebSocket) {
        info!(ip = %self.ip, "{} open", self.conn_id);

        let (mut sink, mut inbound) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(WRITER_QUEUE);
        let conn_id = self.conn_id;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("{} write failed: {}", conn_id, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let close_frame = loop {
            let Some(message) = inbound.next().await else {
                break None;
            };
            let (codec, payload) = match message {
                Ok(Message::Text(text)) => (Codec::Json, text.into_bytes()),
                Ok(Message::Binary(bytes)) => (Codec::MessagePack, bytes),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break None,
                Err(e) => {
                    debug!("{} read failed: {}", conn_id, e);
                    break None;
                }
            };

            match self.admit(codec, &payload).await {
                Admission::Dispatch(frame) => {
                    let registry = self.registry.clone();
                    let conn = self.connection();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = registry.dispatch_frame(frame, &conn).await;
                        if let Some(message) = encode(codec, &reply) {
                            let _ = tx.send(message).await;
                        }
                    });
                }
                Admission::Reply(reply) => {
                    if let Some(message) = encode(codec, &reply) {
                        let _ = tx.send(message).await;
                    }
                }
                Admission::Close(frame) => break Some(frame),
            }
        };

        if let Some(frame) = close_frame {
            let _ = tx.send(Message::Close(Some(frame))).await;
        }

        self.limiter.untrack_connection(conn_id).await;
        info!(ip = %self.ip, "{} closed", conn_id);
    }
}

fn close(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }
}

fn encode(codec: Codec, reply: &Reply) -> Option<Message> {
    let bytes = match reply.encode(codec) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            return None;
        }
    };
    match codec {
        Codec::MessagePack => Some(Message::Binary(bytes)),
        Codec::Json => match String::from_utf8(bytes) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                error!("JSON reply was not UTF-8: {}", e);
                None
            }
        },
    }
}
