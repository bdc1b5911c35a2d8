//! Per-request context handed to middleware and handlers.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::Extensions;
use tidewire_common::ConnectionId;

/// Which ingress path a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Http,
    /// Direct calls into the registry, e.g. from tests or embedding code.
    Local,
}

/// Connection metadata the registry needs to dispatch a request.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Set for stream connections, which are tracked by the rate limiter.
    pub connection_id: Option<ConnectionId>,
    pub ip: Option<IpAddr>,
    pub transport: TransportKind,
}

impl ConnectionContext {
    pub fn stream(connection_id: ConnectionId, ip: IpAddr) -> Self {
        Self {
            connection_id: Some(connection_id),
            ip: Some(ip),
            transport: TransportKind::Stream,
        }
    }

    pub fn http(ip: Option<IpAddr>) -> Self {
        Self {
            connection_id: None,
            ip,
            transport: TransportKind::Http,
        }
    }

    pub fn local() -> Self {
        Self {
            connection_id: None,
            ip: None,
            transport: TransportKind::Local,
        }
    }
}

/// Request-scoped bag shared between middleware and the handler.
///
/// Clones refer to the same extension map, so values a middleware inserts
/// are visible to the handler it wraps.
#[derive(Clone)]
pub struct Context {
    connection: ConnectionContext,
    extensions: Arc<Mutex<Extensions>>,
}

impl Context {
    pub fn new(connection: ConnectionContext) -> Self {
        Self {
            connection,
            extensions: Arc::new(Mutex::new(Extensions::new())),
        }
    }

    pub fn connection(&self) -> &ConnectionContext {
        &self.connection
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.connection_id
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.connection.ip
    }

    pub fn transport(&self) -> TransportKind {
        self.connection.transport
    }

    /// Stores a value, returning the previous one of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.lock().insert(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.lock().get::<T>().cloned()
    }

    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.lock().remove::<T>()
    }

    fn lock(&self) -> MutexGuard<'_, Extensions> {
        self.extensions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
