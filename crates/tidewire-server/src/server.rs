//! RPC Server
//!
//! Wires the method registry, the token authenticator and the rate limiter
//! into an axum router serving every endpoint.
//!
//! # Example
//!
//! ```no_run
//! use tidewire_common::{RpcValue, TidewireConfig};
//! use tidewire_server::{Context, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> tidewire_common::Result<()> {
//!     let server = RpcServer::new(TidewireConfig::default())?;
//!     server
//!         .register("echo", |args: rmpv::Value, _ctx: Context| async move {
//!             Ok(RpcValue::from(args))
//!         })
//!         .await;
//!     server.run("127.0.0.1:8080".parse().unwrap()).await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};

use tidewire_common::token::initialize_secret;
use tidewire_common::{
    RateLimiter, Result, SecretSource, TidewireConfig, TidewireError, TokenAuthenticator,
};

use crate::middleware::Middleware;
use crate::registry::{Handler, MethodRegistry};
use crate::transport::http::{health_handler, http_handler, token_handler};
use crate::transport::stream::stream_handler;
use crate::transport::TransportState;

/// A configured server. Methods may be registered before or while it runs.
pub struct RpcServer {
    config: Arc<TidewireConfig>,
    registry: Arc<MethodRegistry>,
    auth: Arc<TokenAuthenticator>,
    limiter: RateLimiter,
}

impl RpcServer {
    /// Creates a server from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `TidewireError::Config` if the configuration is invalid or the
    /// token secret cannot be set up.
    pub fn new(config: TidewireConfig) -> Result<Self> {
        config.validate_strict()?;

        if let Some(secret) = &config.token_secret {
            if !initialize_secret(SecretSource::Hex(secret.clone()))? {
                warn!("Token secret already initialized, ignoring configured secret");
            }
        }

        let auth = TokenAuthenticator::new(config.token())?.into_shared();
        let limiter = RateLimiter::new(config.rate_limit());
        let registry = MethodRegistry::new()
            .with_rate_limiter(limiter.clone())
            .with_max_batch_size(config.max_batch_size);

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            auth,
            limiter,
        })
    }

    pub fn config(&self) -> &TidewireConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<MethodRegistry> {
        self.registry.clone()
    }

    pub fn authenticator(&self) -> Arc<TokenAuthenticator> {
        self.auth.clone()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Registers a method on the underlying registry.
    pub async fn register(&self, id: impl Into<String>, handler: impl Handler) {
        self.registry.register(id, handler).await;
    }

    pub async fn set_middleware(&self, middleware: impl Middleware) {
        self.registry.set_middleware(Arc::new(middleware)).await;
    }

    /// Builds the router. It needs `ConnectInfo<SocketAddr>`, so serve it with
    /// `into_make_service_with_connect_info`.
    pub fn router(&self) -> Router {
        let paths = &self.config.paths;
        let state = TransportState {
            registry: self.registry.clone(),
            auth: self.auth.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        };

        let mut fallback: Router<TransportState> = Router::new().route(&paths.http, post(http_handler));
        if self.config.compression.enabled {
            let threshold =
                u16::try_from(self.config.compression.threshold_bytes).unwrap_or(u16::MAX);
            fallback = fallback.layer(CompressionLayer::new().compress_when(SizeAbove::new(threshold)));
        }

        Router::new()
            .route(&paths.stream, get(stream_handler))
            .route(&paths.token, post(token_handler))
            .route(&paths.health, get(health_handler))
            .merge(fallback)
            .with_state(state)
    }

    /// Serves on an already bound listener until the process exits.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| TidewireError::Transport(format!("Failed to get local address: {}", e)))?;
        info!("tidewire server listening on {}", addr);
        info!(
            "stream: {}, http: {}, token: {}",
            self.config.paths.stream, self.config.paths.http, self.config.paths.token
        );

        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| TidewireError::Transport(format!("Server error: {}", e)))
    }

    /// Binds `addr` and serves.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TidewireError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }
}
