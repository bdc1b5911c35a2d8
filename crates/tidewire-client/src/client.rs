use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use tidewire_common::codec::{json_to_msgpack, msgpack_to_json};
use tidewire_common::{Codec, RequestId, Result, RpcRequest, RpcResponse, TidewireError};

use crate::into_result;

const TOKEN_HEADER: &str = "x-tidewire-token";
const REFRESH_HEADER: &str = "x-tidewire-refresh";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    token: String,
    expires_in_ms: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Client for the HTTP POST fallback.
///
/// Tokens are fetched from the refresh endpoint on first use and renewed
/// shortly before they expire, or after the server rejects one.
pub struct RpcClient {
    base_url: String,
    rpc_path: String,
    token_path: String,
    codec: Codec,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
    next_id: AtomicI64,
}

impl RpcClient {
    /// Creates a client for the server at `base_url`, e.g.
    /// `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TidewireError::Config(format!(
                "Invalid server address '{}': must start with http:// or https://",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TidewireError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            rpc_path: "/__rpc".to_string(),
            token_path: "/__rpc/token".to_string(),
            codec: Codec::Json,
            http,
            token: RwLock::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    /// Selects the wire codec for requests. Responses are decoded by their
    /// `Content-Type`.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_paths(mut self, rpc_path: impl Into<String>, token_path: impl Into<String>) -> Self {
        self.rpc_path = rpc_path.into();
        self.token_path = token_path.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Requests a fresh token and caches it.
    pub async fn fetch_token(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, self.token_path);
        let res = self
            .http
            .post(&url)
            .header(REFRESH_HEADER, "1")
            .send()
            .await
            .map_err(|e| TidewireError::Transport(format!("Token request failed: {}", e)))?;

        if !res.status().is_success() {
            return Err(TidewireError::Auth(format!(
                "token endpoint answered {}",
                res.status()
            )));
        }

        let grant: TokenGrant = res
            .json()
            .await
            .map_err(|e| TidewireError::Transport(format!("Malformed token response: {}", e)))?;

        // Renew once 90% of the lifetime has passed.
        let lifetime = Duration::from_millis(grant.expires_in_ms.saturating_mul(9) / 10);
        *self.token.write().await = Some(CachedToken {
            value: grant.token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        debug!("Fetched token valid for {}ms", grant.expires_in_ms);

        Ok(grant.token)
    }

    async fn current_token(&self) -> Result<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }
        self.fetch_token().await
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Calls `method` with JSON args and returns the JSON result.
    ///
    /// An `ok: false` response becomes `TidewireError::Handler` carrying the
    /// server's message.
    pub async fn call(&self, method: impl Into<String>, args: Value) -> Result<Value> {
        let response = self.call_value(method, json_to_msgpack(&args)).await?;
        into_result(response).map(|value| msgpack_to_json(&value))
    }

    /// Calls `method` and returns the full response.
    pub async fn call_value(&self, method: impl Into<String>, args: rmpv::Value) -> Result<RpcResponse> {
        let request = RpcRequest::new(self.next_id(), method, args);
        let body = self.codec.encode_request(&request)?;
        self.post(body)
            .await?
            .into_iter()
            .find(|r| r.id == request.id)
            .ok_or_else(|| TidewireError::Protocol(format!("no response for request {}", request.id)))
    }

    /// Sends several calls as one batch. Responses are returned in call
    /// order.
    pub async fn call_batch<M: Into<String>>(
        &self,
        calls: impl IntoIterator<Item = (M, rmpv::Value)>,
    ) -> Result<Vec<RpcResponse>> {
        let requests: Vec<RpcRequest> = calls
            .into_iter()
            .map(|(method, args)| RpcRequest::new(self.next_id(), method, args))
            .collect();
        let body = self.codec.encode_batch_request(&requests)?;
        let mut responses = self.post(body).await?;

        requests
            .iter()
            .map(|request| {
                let pos = responses
                    .iter()
                    .position(|r| r.id == request.id)
                    .ok_or_else(|| {
                        TidewireError::Protocol(format!("no response for request {}", request.id))
                    })?;
                Ok(responses.swap_remove(pos))
            })
            .collect()
    }

    async fn post(&self, body: Vec<u8>) -> Result<Vec<RpcResponse>> {
        let url = format!("{}{}", self.base_url, self.rpc_path);
        let token = self.current_token().await?;

        let res = self
            .http
            .post(&url)
            .header(TOKEN_HEADER, token)
            .header(CONTENT_TYPE, self.codec.content_type())
            .body(body)
            .send()
            .await
            .map_err(|e| TidewireError::Transport(format!("Request to {} failed: {}", url, e)))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.token.write().await = None;
            return Err(TidewireError::Auth("server rejected token".into()));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(TidewireError::Transport(format!("HTTP {}: {}", status, text)));
        }

        let codec = Codec::from_content_type(
            res.headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let bytes = res
            .bytes()
            .await
            .map_err(|e| TidewireError::Transport(format!("Failed to read response: {}", e)))?;

        codec.decode_responses(&bytes)
    }
}
