//! WebSocket stream client.
//!
//! One reader task routes replies to waiting calls by request id, so calls
//! may be issued concurrently from many tasks over a single connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use tidewire_common::codec::{json_to_msgpack, msgpack_to_json};
use tidewire_common::{Codec, RequestId, Result, RpcRequest, RpcResponse, TidewireError};

use crate::into_result;

const SUBPROTOCOL: &str = "tidewire-v1";

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<RpcResponse>>>>;

/// Client holding one stream connection.
pub struct StreamClient {
    outbound: mpsc::Sender<Message>,
    pending: Pending,
    closed_reason: Arc<Mutex<Option<String>>>,
    codec: Codec,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
}

impl StreamClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:8080/rpc`) with `token`,
    /// sending JSON text frames.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        Self::connect_with_codec(url, token, Codec::Json).await
    }

    pub async fn connect_with_codec(url: &str, token: &str, codec: Codec) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TidewireError::Config(format!("Invalid stream URL '{}': {}", url, e)))?;
        let protocols = HeaderValue::from_str(&format!("{SUBPROTOCOL}, {token}"))
            .map_err(|e| TidewireError::Auth(format!("token is not a valid header value: {e}")))?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", protocols);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        debug!("Connected to {}", url);

        let (mut sink, mut inbound) = socket.split();
        let (outbound, mut rx) = mpsc::channel::<Message>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed_reason = Arc::new(Mutex::new(None));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Stream write failed: {}", e);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_reason = closed_reason.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                let (codec, payload) = match message {
                    Ok(Message::Text(text)) => (Codec::Json, text.into_bytes()),
                    Ok(Message::Binary(bytes)) => (Codec::MessagePack, bytes),
                    Ok(Message::Close(frame)) => {
                        let reason = match frame {
                            Some(f) => format!("closed by server ({}): {}", u16::from(f.code), f.reason),
                            None => "closed by server".to_string(),
                        };
                        *lock(&reader_reason) = Some(reason);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        *lock(&reader_reason) = Some(format!("connection lost: {e}"));
                        break;
                    }
                };

                match codec.decode_responses(&payload) {
                    Ok(responses) => {
                        let mut pending = lock(&reader_pending);
                        for response in responses {
                            match pending.remove(&response.id) {
                                Some(waiter) => {
                                    let _ = waiter.send(response);
                                }
                                None => warn!("Reply for unknown request {}", response.id),
                            }
                        }
                    }
                    Err(e) => warn!("Undecodable reply: {}", e),
                }
            }
            // Waiters still pending see their sender dropped.
            lock(&reader_pending).clear();
        });

        Ok(Self {
            outbound,
            pending,
            closed_reason,
            codec,
            next_id: AtomicI64::new(1),
            reader,
        })
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn closed_error(&self) -> TidewireError {
        let reason = lock(&self.closed_reason)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        TidewireError::Transport(reason)
    }

    fn frame(&self, bytes: Vec<u8>) -> Result<Message> {
        match self.codec {
            Codec::MessagePack => Ok(Message::Binary(bytes)),
            Codec::Json => String::from_utf8(bytes)
                .map(Message::Text)
                .map_err(|e| TidewireError::Protocol(e.to_string())),
        }
    }

    async fn send_and_wait(
        &self,
        ids: Vec<RequestId>,
        message: Message,
    ) -> Result<Vec<RpcResponse>> {
        let receivers: Vec<oneshot::Receiver<RpcResponse>> = {
            let mut pending = lock(&self.pending);
            ids.iter()
                .map(|id| {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(id.clone(), tx);
                    rx
                })
                .collect()
        };

        if self.outbound.send(message).await.is_err() {
            let mut pending = lock(&self.pending);
            for id in &ids {
                pending.remove(id);
            }
            return Err(self.closed_error());
        }

        let mut responses = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(response) => responses.push(response),
                Err(_) => return Err(self.closed_error()),
            }
        }
        Ok(responses)
    }

    /// Calls `method` and returns the full response.
    pub async fn call(&self, method: impl Into<String>, args: rmpv::Value) -> Result<RpcResponse> {
        let request = RpcRequest::new(self.next_id(), method, args);
        let message = self.frame(self.codec.encode_request(&request)?)?;
        let mut responses = self.send_and_wait(vec![request.id.clone()], message).await?;
        responses
            .pop()
            .ok_or_else(|| TidewireError::Protocol(format!("no response for request {}", request.id)))
    }

    /// Calls `method` with JSON args and returns the JSON result.
    pub async fn call_json(&self, method: impl Into<String>, args: Value) -> Result<Value> {
        let response = self.call(method, json_to_msgpack(&args)).await?;
        into_result(response).map(|value| msgpack_to_json(&value))
    }

    /// Sends several calls as one frame. Responses are returned in call
    /// order.
    pub async fn call_batch<M: Into<String>>(
        &self,
        calls: impl IntoIterator<Item = (M, rmpv::Value)>,
    ) -> Result<Vec<RpcResponse>> {
        let requests: Vec<RpcRequest> = calls
            .into_iter()
            .map(|(method, args)| RpcRequest::new(self.next_id(), method, args))
            .collect();
        let message = self.frame(self.codec.encode_batch_request(&requests)?)?;
        let ids = requests.into_iter().map(|r| r.id).collect();
        self.send_and_wait(ids, message).await
    }

    /// Whether the server has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Sends a close frame and waits for the server to finish the handshake.
    pub async fn close(mut self) -> Result<()> {
        if self.outbound.send(Message::Close(None)).await.is_err() {
            return Ok(());
        }
        (&mut self.reader)
            .await
            .map_err(|e| TidewireError::Transport(format!("Reader task failed: {}", e)))
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn handshake_error(err: WsError) -> TidewireError {
    match err {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TidewireError::Auth("server rejected token".into())
        }
        WsError::Http(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
            TidewireError::Capacity("this address".into())
        }
        other => TidewireError::Transport(format!("Handshake failed: {}", other)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
