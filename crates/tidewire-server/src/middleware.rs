//! Request interceptor.
//!
//! A single [`Middleware`] wraps every method dispatch on streams, and every
//! HTTP fallback request once as a whole. It receives the request's
//! [`MiddlewareContext`] and a [`Next`] continuation:
//!
//! - calling [`Next::proceed`] runs the wrapped handler (or, for HTTP
//!   requests, the rest of the request pipeline) and returns its error, if
//!   any, so the handler's rejection propagates normally;
//! - code after `proceed().await` runs once the handler has finished;
//! - returning without calling `proceed` blocks the request. RPC callers get
//!   an `ok: false` "Request blocked" response, HTTP callers get a 403;
//! - returning an error before calling `proceed` fails the request with
//!   that error's message.
//!
//! `proceed` takes `self`, so it can run at most once.
//!
//! # Example
//!
//! ```
//! use tidewire_server::middleware::{from_fn, MiddlewareContext, Next};
//!
//! let audit = from_fn(|ctx: &mut MiddlewareContext, next: Next| {
//!     Box::pin(async move {
//!         if ctx.method_name() == Some("admin.reset") {
//!             return Ok(());
//!         }
//!         next.proceed().await
//!     })
//! });
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::context::Context;

/// What kind of request is being intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Method { method_name: String },
    Http { http_method: String, http_path: String },
}

#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    /// Shared with the handler. Values inserted here reach it.
    pub ctx: Context,
    pub kind: RequestKind,
}

impl MiddlewareContext {
    pub fn method(ctx: Context, method_name: impl Into<String>) -> Self {
        Self {
            ctx,
            kind: RequestKind::Method {
                method_name: method_name.into(),
            },
        }
    }

    pub fn http(ctx: Context, http_method: impl Into<String>, http_path: impl Into<String>) -> Self {
        Self {
            ctx,
            kind: RequestKind::Http {
                http_method: http_method.into(),
                http_path: http_path.into(),
            },
        }
    }

    pub fn method_name(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Method { method_name } => Some(method_name),
            RequestKind::Http { .. } => None,
        }
    }

    pub fn http_method(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Http { http_method, .. } => Some(http_method),
            RequestKind::Method { .. } => None,
        }
    }

    pub fn http_path(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Http { http_path, .. } => Some(http_path),
            RequestKind::Method { .. } => None,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self.kind, RequestKind::Http { .. })
    }
}

type Continuation = Box<dyn FnOnce(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// The wrapped remainder of the request.
pub struct Next {
    run: Continuation,
    ctx: Context,
    proceeded: Arc<AtomicBool>,
}

impl Next {
    /// Runs the wrapped handler and returns its error, if any.
    pub async fn proceed(self) -> anyhow::Result<()> {
        self.proceeded.store(true, Ordering::SeqCst);
        (self.run)(self.ctx).await
    }
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next) -> anyhow::Result<()>;
}

/// Middleware built from a closure returning a boxed future.
pub struct FnMiddleware<F>(F);

pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut MiddlewareContext, Next) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut MiddlewareContext, Next) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next) -> anyhow::Result<()> {
        (self.0)(ctx, next).await
    }
}

/// How an intercepted request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The continuation ran and the middleware returned normally.
    Completed,
    /// The middleware returned without running the continuation.
    Blocked,
    /// The middleware (or the continuation it propagated) failed.
    Failed(String),
}

/// Runs `run` inside `middleware`, or directly when there is none.
pub async fn run_chain<F>(
    middleware: Option<Arc<dyn Middleware>>,
    mut mctx: MiddlewareContext,
    run: F,
) -> ChainOutcome
where
    F: FnOnce(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
{
    let Some(middleware) = middleware else {
        return match run(mctx.ctx.clone()).await {
            Ok(()) => ChainOutcome::Completed,
            Err(e) => ChainOutcome::Failed(e.to_string()),
        };
    };

    let proceeded = Arc::new(AtomicBool::new(false));
    let next = Next {
        run: Box::new(run),
        ctx: mctx.ctx.clone(),
        proceeded: proceeded.clone(),
    };

    match AssertUnwindSafe(middleware.handle(&mut mctx, next))
        .catch_unwind()
        .await
    {
        Err(payload) => ChainOutcome::Failed(panic_message(payload)),
        Ok(Err(e)) => ChainOutcome::Failed(e.to_string()),
        Ok(Ok(())) if proceeded.load(Ordering::SeqCst) => ChainOutcome::Completed,
        Ok(Ok(())) => ChainOutcome::Blocked,
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Handler panicked".to_string()
    }
}
