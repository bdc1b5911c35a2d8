//! Shared helpers for transport integration tests.
//!
//! Each test starts its own server on an ephemeral port, so tests can run in
//! parallel without sharing limiter state.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tidewire_common::{RateLimiter, RpcValue, TidewireConfig, TokenAuthenticator};
use tidewire_server::{Context, MethodRegistry, RpcServer};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<MethodRegistry>,
    pub auth: Arc<TokenAuthenticator>,
    pub limiter: RateLimiter,
    handle: JoinHandle<tidewire_common::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TidewireConfig::default()).await
    }

    pub async fn start_with(config: TidewireConfig) -> Self {
        let server = RpcServer::new(config).expect("valid test config");
        register_test_methods(&server.registry()).await;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        let registry = server.registry();
        let auth = server.authenticator();
        let limiter = server.rate_limiter().clone();
        let handle = tokio::spawn(server.serve(listener));

        Self {
            addr,
            registry,
            auth,
            limiter,
            handle,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}/__rpc", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/__rpc/token", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/rpc", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self) -> String {
        self.auth.generate()
    }

    /// Waits until the limiter has forgotten every connection.
    pub async fn wait_until_untracked(&self) {
        for _ in 0..100 {
            if self.limiter.tracked_connection_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connections still tracked");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// `echo` returns its args, `fail` always errors, `sleep` waits `args` ms,
/// `big` returns `args` bytes of text.
pub async fn register_test_methods(registry: &MethodRegistry) {
    registry
        .register("echo", |args: rmpv::Value, _ctx: Context| async move {
            Ok(RpcValue::from(args))
        })
        .await;
    registry
        .register("fail", |_args: rmpv::Value, _ctx: Context| async move {
            Err::<RpcValue, _>(anyhow::anyhow!("intentional failure"))
        })
        .await;
    registry
        .register("sleep", |args: rmpv::Value, _ctx: Context| async move {
            let ms = args.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(RpcValue::from(ms as i64))
        })
        .await;
    registry
        .register("big", |args: rmpv::Value, _ctx: Context| async move {
            let len = args.as_u64().unwrap_or(0) as usize;
            Ok(RpcValue::from("x".repeat(len)))
        })
        .await;
}
