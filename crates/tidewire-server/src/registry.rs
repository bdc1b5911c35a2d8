//! Method Registry
//!
//! Holds the registered RPC methods and dispatches single and batched
//! requests to them.
//!
//! # Architecture
//!
//! - **Lookup**: methods are keyed by id. Registering an id again replaces
//!   the previous definition, so handlers can be hot-reloaded.
//! - **Interception**: the configured middleware wraps every handler call.
//! - **Containment**: handler errors and panics are caught at the dispatch
//!   boundary and turned into `ok: false` responses.
//! - **Stats**: every response carries the caller's rate-limit snapshot,
//!   read from the limiter at response time.
//!
//! # Example
//!
//! ```
//! use tidewire_common::{RpcRequest, RpcValue};
//! use tidewire_server::{ConnectionContext, Context, MethodRegistry};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let registry = MethodRegistry::new();
//! registry
//!     .register("echo", |args: rmpv::Value, _ctx: Context| async move {
//!         Ok(RpcValue::from(args))
//!     })
//!     .await;
//!
//! let request = RpcRequest::new("1", "echo", rmpv::Value::from("hi"));
//! let response = registry.dispatch(request, &ConnectionContext::local()).await;
//! assert!(response.ok);
//! # });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tidewire_common::codec::Codec;
use tidewire_common::config::DEFAULT_MAX_BATCH_SIZE;
use tidewire_common::{
    Frame, ParsedRequest, RateLimiter, RequestId, RpcRequest, RpcResponse, RpcStats, RpcValue,
    Serializer, TidewireError,
};

use crate::context::{ConnectionContext, Context};
use crate::middleware::{panic_message, run_chain, ChainOutcome, Middleware, MiddlewareContext};

/// Application code behind an RPC method.
///
/// Implemented for any `Fn(rmpv::Value, Context) -> impl Future<Output =
/// anyhow::Result<RpcValue>>`, so plain async closures can be registered.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, args: rmpv::Value, ctx: Context) -> anyhow::Result<RpcValue>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(rmpv::Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RpcValue>> + Send + 'static,
{
    async fn call(&self, args: rmpv::Value, ctx: Context) -> anyhow::Result<RpcValue> {
        (self)(args, ctx).await
    }
}

#[derive(Clone)]
pub struct MethodDefinition {
    pub id: String,
    pub handler: Arc<dyn Handler>,
}

impl MethodDefinition {
    pub fn new(id: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
        }
    }
}

/// Responses to one inbound frame, shaped like the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
}

impl Reply {
    pub fn encode(&self, codec: Codec) -> tidewire_common::Result<Vec<u8>> {
        match self {
            Reply::Single(response) => codec.encode_response(response),
            Reply::Batch(responses) => codec.encode_batch(responses),
        }
    }

    pub fn responses(&self) -> &[RpcResponse] {
        match self {
            Reply::Single(response) => std::slice::from_ref(response),
            Reply::Batch(responses) => responses,
        }
    }

    /// Builds the same error for every id, preserving the frame's shape.
    pub fn error_for(ids: Vec<RequestId>, batch: bool, error: &str, stats: RpcStats) -> Self {
        let mut responses: Vec<RpcResponse> = ids
            .into_iter()
            .map(|id| RpcResponse::error(id, error, stats))
            .collect();
        if batch {
            Reply::Batch(responses)
        } else {
            match responses.pop() {
                Some(response) => Reply::Single(response),
                None => Reply::Batch(Vec::new()),
            }
        }
    }
}

type HandlerOutcome = std::result::Result<RpcValue, String>;

/// Registry of RPC methods.
///
/// All state sits behind locks, so a registry is shared by `Arc` between
/// transports and can be reconfigured while serving.
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, MethodDefinition>>,
    middleware: RwLock<Option<Arc<dyn Middleware>>>,
    rate_limiter: RwLock<Option<RateLimiter>>,
    max_batch_size: AtomicUsize,
    serializer: Serializer,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            middleware: RwLock::new(None),
            rate_limiter: RwLock::new(None),
            max_batch_size: AtomicUsize::new(DEFAULT_MAX_BATCH_SIZE),
            serializer: Serializer::new(),
        }
    }

    pub fn with_rate_limiter(self, limiter: RateLimiter) -> Self {
        Self {
            rate_limiter: RwLock::new(Some(limiter)),
            ..self
        }
    }

    pub fn with_middleware(self, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            middleware: RwLock::new(Some(middleware)),
            ..self
        }
    }

    pub fn with_max_batch_size(self, max: usize) -> Self {
        self.set_max_batch_size(max);
        self
    }

    /// Registers `handler` under `id`, replacing any existing definition.
    pub async fn register(&self, id: impl Into<String>, handler: impl Handler) {
        self.register_definition(MethodDefinition::new(id, handler)).await;
    }

    pub async fn register_definition(&self, definition: MethodDefinition) {
        let mut methods = self.methods.write().await;
        if methods.contains_key(&definition.id) {
            debug!("Replacing method {}", definition.id);
        } else {
            debug!("Registered method {}", definition.id);
        }
        methods.insert(definition.id.clone(), definition);
    }

    /// Removes a method. Returns whether it was registered.
    pub async fn unregister(&self, id: &str) -> bool {
        self.methods.write().await.remove(id).is_some()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.methods.read().await.contains_key(id)
    }

    /// Registered method ids, sorted.
    pub async fn method_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.methods.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn set_middleware(&self, middleware: Arc<dyn Middleware>) {
        *self.middleware.write().await = Some(middleware);
    }

    pub async fn clear_middleware(&self) {
        *self.middleware.write().await = None;
    }

    pub async fn set_rate_limiter(&self, limiter: RateLimiter) {
        *self.rate_limiter.write().await = Some(limiter);
    }

    pub async fn rate_limiter(&self) -> Option<RateLimiter> {
        self.rate_limiter.read().await.clone()
    }

    pub fn set_max_batch_size(&self, max: usize) {
        self.max_batch_size.store(max, Ordering::Relaxed);
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Relaxed)
    }

    pub(crate) async fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        self.middleware.read().await.clone()
    }

    /// Rate-limit snapshot for the caller behind `conn`.
    pub async fn stats_for(&self, conn: &ConnectionContext) -> RpcStats {
        let limiter = self.rate_limiter.read().await.clone();
        match (limiter, conn.connection_id) {
            (Some(limiter), Some(id)) => limiter.rpc_stats(id).await,
            _ => RpcStats::unlimited(),
        }
    }

    /// Dispatches one request. Never fails: every outcome is a response.
    pub async fn dispatch(&self, request: RpcRequest, conn: &ConnectionContext) -> RpcResponse {
        self.invoke(request, &Interception::PerMethod(conn.clone())).await
    }

    async fn invoke(&self, request: RpcRequest, scope: &Interception) -> RpcResponse {
        let RpcRequest { id, method, args } = request;
        let conn = scope.connection();

        let definition = self.methods.read().await.get(&method).cloned();
        let Some(definition) = definition else {
            debug!("Unknown method {} (request {})", method, id);
            let stats = self.stats_for(conn).await;
            return RpcResponse::error(id, TidewireError::UnknownMethod(method).to_string(), stats);
        };

        debug!("Dispatching {} (request {})", method, id);

        let slot: Arc<Mutex<Option<HandlerOutcome>>> = Arc::new(Mutex::new(None));
        let handler_slot = slot.clone();
        let handler = definition.handler;
        let (middleware, ctx) = match scope {
            Interception::PerMethod(conn) => (self.middleware().await, Context::new(conn.clone())),
            Interception::Done(ctx) => (None, ctx.clone()),
        };
        let mctx = MiddlewareContext::method(ctx, method.as_str());

        let outcome = run_chain(middleware, mctx, move |ctx| {
            Box::pin(async move {
                let outcome = match AssertUnwindSafe(handler.call(args, ctx)).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(panic_message(payload)),
                };
                let propagated = match &outcome {
                    Ok(_) => Ok(()),
                    Err(message) => Err(anyhow::anyhow!(message.clone())),
                };
                *handler_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
                propagated
            })
        })
        .await;

        let handler_outcome = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        let stats = self.stats_for(conn).await;

        match (outcome, handler_outcome) {
            (ChainOutcome::Blocked, _) => {
                debug!("Middleware blocked {} (request {})", method, id);
                RpcResponse::error(id, TidewireError::MiddlewareBlocked.to_string(), stats)
            }
            (ChainOutcome::Failed(message), _) => {
                debug!("Method {} failed: {}", method, message);
                RpcResponse::error(id, message, stats)
            }
            (ChainOutcome::Completed, Some(Ok(value))) => {
                RpcResponse::success(id, self.serializer.prepare(&value), stats)
            }
            (ChainOutcome::Completed, Some(Err(message))) => RpcResponse::error(id, message, stats),
            (ChainOutcome::Completed, None) => {
                RpcResponse::error(id, TidewireError::MiddlewareBlocked.to_string(), stats)
            }
        }
    }

    /// Dispatches a batch. Items run concurrently and each is answered
    /// independently. An oversized batch is rejected item by item.
    pub async fn dispatch_batch(
        &self,
        requests: Vec<RpcRequest>,
        conn: &ConnectionContext,
    ) -> Vec<RpcResponse> {
        let items = requests.into_iter().map(ParsedRequest::Valid).collect();
        self.dispatch_parsed_batch(items, &Interception::PerMethod(conn.clone()))
            .await
    }

    /// Dispatches a decoded frame, answering malformed items by id.
    pub async fn dispatch_frame(&self, frame: Frame, conn: &ConnectionContext) -> Reply {
        self.dispatch_scoped(frame, &Interception::PerMethod(conn.clone()))
            .await
    }

    /// Dispatches a frame whose transport already ran the middleware around
    /// the whole request. Handlers share `ctx`, so values the middleware
    /// stored in it are visible to them.
    pub(crate) async fn dispatch_intercepted_frame(&self, frame: Frame, ctx: &Context) -> Reply {
        self.dispatch_scoped(frame, &Interception::Done(ctx.clone()))
            .await
    }

    async fn dispatch_scoped(&self, frame: Frame, scope: &Interception) -> Reply {
        match frame {
            Frame::Single(item) => Reply::Single(self.dispatch_parsed(item, scope).await),
            Frame::Batch(items) => Reply::Batch(self.dispatch_parsed_batch(items, scope).await),
        }
    }

    async fn dispatch_parsed(&self, item: ParsedRequest, scope: &Interception) -> RpcResponse {
        match item {
            ParsedRequest::Valid(request) => self.invoke(request, scope).await,
            ParsedRequest::Invalid { id, reason } => {
                let stats = self.stats_for(scope.connection()).await;
                RpcResponse::error(id, TidewireError::Protocol(reason).to_string(), stats)
            }
        }
    }

    async fn dispatch_parsed_batch(
        &self,
        items: Vec<ParsedRequest>,
        scope: &Interception,
    ) -> Vec<RpcResponse> {
        let max = self.max_batch_size();
        if items.len() > max {
            warn!("Rejecting batch of {} (max {})", items.len(), max);
            let stats = self.stats_for(scope.connection()).await;
            let message = format!("Batch size {} exceeds maximum of {}", items.len(), max);
            return items
                .into_iter()
                .map(|item| RpcResponse::error(item.id().clone(), message.as_str(), stats))
                .collect();
        }

        join_all(items.into_iter().map(|item| self.dispatch_parsed(item, scope))).await
    }
}

/// Whether the registry still has to run the middleware for a call.
enum Interception {
    /// Each method call runs inside the middleware with a fresh context.
    PerMethod(ConnectionContext),
    /// The transport already ran the middleware around the request.
    Done(Context),
}

impl Interception {
    fn connection(&self) -> &ConnectionContext {
        match self {
            Interception::PerMethod(conn) => conn,
            Interception::Done(ctx) => ctx.connection(),
        }
    }
}
