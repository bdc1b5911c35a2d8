//! Stream Transport Integration Tests
//!
//! Tests cover:
//! - Handshake authentication and sub-protocol selection
//! - Per-IP connection caps
//! - Per-connection message windows
//! - JSON text frames, MessagePack binary frames and batches
//! - Close codes for oversized and undecodable frames
//! - Concurrent dispatch of independent frames
//! - Per-method middleware decisions

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tidewire_common::{Codec, RequestId, RpcRequest, TidewireConfig};
use tidewire_server::{from_fn, MiddlewareContext, Next};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

mod common;
use common::TestServer;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_with(server: &TestServer, protocols: &str) -> Result<Socket, WsError> {
    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", protocols.parse().unwrap());
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(socket, _)| socket)
}

async fn connect(server: &TestServer) -> Socket {
    connect_with(server, &format!("tidewire-v1, {}", server.token()))
        .await
        .expect("handshake should succeed")
}

fn rejection_status(err: WsError) -> StatusCode {
    match err {
        WsError::Http(response) => response.status(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(socket: &mut Socket) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for reply")
        .expect("socket closed")
        .expect("read failed");
    match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn recv_close_code(socket: &mut Socket) -> u16 {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("socket ended without close frame")
            .expect("read failed");
        if let Message::Close(frame) = message {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_selects_subprotocol() {
    let server = TestServer::start().await;
    let mut request = server.ws_url().into_client_request().unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        format!("tidewire-v1, {}", server.token()).parse().unwrap(),
    );
    let (_socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers()["sec-websocket-protocol"].to_str().unwrap(),
        "tidewire-v1"
    );
    assert_eq!(server.limiter.tracked_connection_count().await, 1);
}

#[tokio::test]
async fn test_token_only_offer_echoes_token() {
    let server = TestServer::start().await;
    let token = server.token();
    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", token.parse().unwrap());
    let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers()["sec-websocket-protocol"].to_str().unwrap(),
        token
    );

    send_json(&mut socket, json!({"id": 1, "method": "echo", "args": "hi"})).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["result"], "hi");
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let server = TestServer::start().await;
    let err = connect_with(&server, "tidewire-v1").await.unwrap_err();
    assert_eq!(rejection_status(err), StatusCode::UNAUTHORIZED);
    assert_eq!(server.limiter.tracked_connection_count().await, 0);
}

#[tokio::test]
async fn test_tampered_token_rejected() {
    let server = TestServer::start().await;
    let token = server.token();
    let (ts, sig) = token.split_once('.').unwrap();
    let flipped = if sig.starts_with('0') { "1" } else { "0" };
    let tampered = format!("{ts}.{flipped}{}", &sig[1..]);

    let err = connect_with(&server, &format!("tidewire-v1, {tampered}"))
        .await
        .unwrap_err();
    assert_eq!(rejection_status(err), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_connection_cap_per_ip() {
    let server = TestServer::start_with(TidewireConfig {
        max_connections_per_ip: 2,
        ..TidewireConfig::default()
    })
    .await;

    let first = connect(&server).await;
    let _second = connect(&server).await;

    let err = connect_with(&server, &format!("tidewire-v1, {}", server.token()))
        .await
        .unwrap_err();
    assert_eq!(rejection_status(err), StatusCode::TOO_MANY_REQUESTS);

    // Closing one connection frees a slot.
    drop(first);
    let mut admitted = false;
    for _ in 0..100 {
        if connect_with(&server, &format!("tidewire-v1, {}", server.token()))
            .await
            .is_ok()
        {
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted);
}

// ============================================================================
// Dispatch Tests
// ============================================================================

#[tokio::test]
async fn test_float_id_answered_without_closing() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    send_json(&mut socket, json!({"id": 1.5, "method": "echo", "args": 1})).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["id"], json!(1.5));
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["result"], 1);

    // The connection is still usable.
    send_json(&mut socket, json!({"id": 2, "method": "echo", "args": 2})).await;
    assert_eq!(recv_json(&mut socket).await["id"], 2);
}

#[tokio::test]
async fn test_echo_over_text_frame() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    send_json(&mut socket, json!({"id": "1", "method": "echo", "args": {"x": 1}})).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["id"], "1");
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["result"], json!({"x": 1}));
    assert_eq!(reply["stats"]["remainingRequests"], 99);
    assert!(reply["stats"]["resetInSeconds"].as_u64().unwrap() <= 60);
}

#[tokio::test]
async fn test_batch_over_stream() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    send_json(
        &mut socket,
        json!([
            {"id": 1, "method": "echo", "args": "a"},
            {"id": 2, "method": "missing"},
            {"id": 3, "method": "fail"}
        ]),
    )
    .await;
    let reply = recv_json(&mut socket).await;
    let items = reply.as_array().unwrap();
    assert_eq!(items.len(), 3);
    let find = |id: i64| items.iter().find(|r| r["id"] == id).unwrap();
    assert_eq!(find(1)["result"], "a");
    assert_eq!(find(2)["error"], "Unknown method missing");
    assert_eq!(find(3)["error"], "intentional failure");

    // The whole batch counted as one message.
    for item in items {
        assert_eq!(item["stats"]["remainingRequests"], 99);
    }
}

#[tokio::test]
async fn test_middleware_blocks_single_method_in_batch() {
    let server = TestServer::start().await;
    server
        .registry
        .set_middleware(Arc::new(from_fn(|ctx: &mut MiddlewareContext, next: Next| {
            Box::pin(async move {
                if ctx.method_name() == Some("fail") {
                    return Ok(());
                }
                next.proceed().await
            })
        })))
        .await;
    let mut socket = connect(&server).await;

    send_json(
        &mut socket,
        json!([{"id": 1, "method": "echo", "args": 1}, {"id": 2, "method": "fail"}]),
    )
    .await;
    let reply = recv_json(&mut socket).await;
    let items = reply.as_array().unwrap();
    let find = |id: i64| items.iter().find(|r| r["id"] == id).unwrap();
    assert_eq!(find(1)["result"], 1);
    assert_eq!(find(2)["error"], "Request blocked");
}

#[tokio::test]
async fn test_binary_frames_use_msgpack() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    let request = RpcRequest::new(11, "echo", rmpv::Value::from(42));
    let bytes = Codec::MessagePack.encode_request(&request).unwrap();
    socket.send(Message::Binary(bytes)).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(payload) = message else {
        panic!("expected binary reply");
    };
    let responses = Codec::MessagePack.decode_responses(&payload).unwrap();
    assert_eq!(responses[0].id, RequestId::from(11));
    assert_eq!(responses[0].result, Some(rmpv::Value::from(42)));
}

#[tokio::test]
async fn test_slow_frame_does_not_block_fast_frame() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    send_json(&mut socket, json!({"id": "slow", "method": "sleep", "args": 500})).await;
    send_json(&mut socket, json!({"id": "fast", "method": "echo", "args": 1})).await;

    assert_eq!(recv_json(&mut socket).await["id"], "fast");
    assert_eq!(recv_json(&mut socket).await["id"], "slow");
}

// ============================================================================
// Rate Limit Tests
// ============================================================================

#[tokio::test]
async fn test_sixth_message_in_window_is_rejected() {
    let server = TestServer::start_with(TidewireConfig {
        max_messages_per_window: 5,
        rate_limit_window_ms: 60_000,
        ..TidewireConfig::default()
    })
    .await;
    let mut socket = connect(&server).await;

    for i in 0..5 {
        send_json(&mut socket, json!({"id": i, "method": "echo", "args": i})).await;
        let reply = recv_json(&mut socket).await;
        assert_eq!(reply["ok"], true, "message {i} should pass");
        assert_eq!(reply["stats"]["remainingRequests"], 4 - i);
    }

    send_json(&mut socket, json!({"id": 5, "method": "echo"})).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"], "Rate limit exceeded");
    assert_eq!(reply["stats"]["remainingRequests"], 0);
    assert!(reply["stats"]["resetInSeconds"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_window_resets() {
    let server = TestServer::start_with(TidewireConfig {
        max_messages_per_window: 1,
        rate_limit_window_ms: 300,
        ..TidewireConfig::default()
    })
    .await;
    let mut socket = connect(&server).await;

    send_json(&mut socket, json!({"id": 1, "method": "echo"})).await;
    assert_eq!(recv_json(&mut socket).await["ok"], true);
    send_json(&mut socket, json!({"id": 2, "method": "echo"})).await;
    assert_eq!(recv_json(&mut socket).await["ok"], false);

    tokio::time::sleep(Duration::from_millis(400)).await;
    send_json(&mut socket, json!({"id": 3, "method": "echo"})).await;
    assert_eq!(recv_json(&mut socket).await["ok"], true);
}

// ============================================================================
// Close Code Tests
// ============================================================================

#[tokio::test]
async fn test_oversized_frame_closes_with_1009() {
    let server = TestServer::start_with(TidewireConfig {
        max_frame_payload: 64,
        ..TidewireConfig::default()
    })
    .await;
    let mut socket = connect(&server).await;

    send_json(&mut socket, json!({"id": 1, "method": "echo", "args": "p".repeat(70)})).await;
    assert_eq!(recv_close_code(&mut socket).await, 1009);
    server.wait_until_untracked().await;
}

#[tokio::test]
async fn test_undecodable_frame_closes_with_1002() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;

    socket.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(recv_close_code(&mut socket).await, 1002);
    server.wait_until_untracked().await;
}

#[tokio::test]
async fn test_client_close_untracks() {
    let server = TestServer::start().await;
    let mut socket = connect(&server).await;
    assert_eq!(server.limiter.tracked_connection_count().await, 1);

    socket.close(None).await.unwrap();
    server.wait_until_untracked().await;
}
