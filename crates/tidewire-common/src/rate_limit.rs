//! Rate Limiting for tidewire
//!
//! Two independent admission axes are enforced:
//! - **Per-IP connection cap**: how many connections one address may hold
//!   open at once, checked when a connection is admitted.
//! - **Per-connection message quota**: how many messages a connection may
//!   send within a fixed window, checked for every inbound frame.
//!
//! # Algorithm
//!
//! The message quota uses a fixed window with lazy reset. Nothing runs on a
//! timer. When a message arrives after the window has elapsed, the window
//! restarts at that moment and the message counts as the first of the new
//! window. Rejected messages are not counted.
//!
//! A limit of `0` disables the corresponding axis.
//!
//! # Example
//!
//! ```
//! use tidewire_common::rate_limit::{ConnectionId, RateLimitConfig, RateLimiter};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = RateLimiter::new(RateLimitConfig::new(5, 2, 1000));
//! let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! let conn = ConnectionId::next();
//!
//! assert!(limiter.track_connection(conn, ip).await);
//! assert!(limiter.check_rate_limit(conn).await.is_allowed());
//! assert!(limiter.check_rate_limit(conn).await.is_allowed());
//! assert!(!limiter.check_rate_limit(conn).await.is_allowed());
//!
//! limiter.untrack_connection(conn).await;
//! # });
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::RpcStats;
use crate::time::{system_clock, SharedClock};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier minted when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Returns a process-unique id.
    pub fn next() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Configuration for connection admission and message rate limiting.
///
/// # Fields
///
/// * `max_connections_per_ip` - Concurrent connections allowed per address (`0` = unlimited)
/// * `max_messages_per_window` - Messages allowed per connection per window (`0` = unlimited)
/// * `window` - Length of the message window
///
/// # Example
///
/// ```
/// use tidewire_common::rate_limit::RateLimitConfig;
///
/// let config = RateLimitConfig::new(5, 100, 60_000);
/// assert_eq!(config.max_connections_per_ip, 5);
/// assert!(config.limits_messages());
///
/// assert!(!RateLimitConfig::disabled().limits_messages());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_connections_per_ip: u32,
    pub max_messages_per_window: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// Creates a new configuration.
    ///
    /// # Arguments
    ///
    /// * `max_connections_per_ip` - Connection cap per address, `0` disables it
    /// * `max_messages_per_window` - Message quota per connection, `0` disables it
    /// * `window_ms` - Window length in milliseconds
    pub fn new(max_connections_per_ip: u32, max_messages_per_window: u32, window_ms: u64) -> Self {
        Self {
            max_connections_per_ip,
            max_messages_per_window,
            window: Duration::from_millis(window_ms),
        }
    }

    /// Creates a configuration with both axes disabled.
    pub fn disabled() -> Self {
        Self::new(0, 0, 60_000)
    }

    pub fn limits_messages(&self) -> bool {
        self.max_messages_per_window > 0
    }

    pub fn limits_connections(&self) -> bool {
        self.max_connections_per_ip > 0
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

impl Default for RateLimitConfig {
    /// 10 connections per address, 100 messages per minute.
    fn default() -> Self {
        Self::new(10, 100, 60_000)
    }
}

/// Result of a rate limit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Message is allowed
    Allowed,
    /// Message is rate limited
    RateLimited {
        /// Time until the current window resets
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Returns whether the message is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns the retry-after duration if rate limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

/// Computed view of a connection's quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionStats {
    pub message_count: u32,
    pub remaining_messages: u32,
    /// Absolute time (epoch ms) at which the current window ends.
    pub reset_time_ms: u64,
}

/// Per-connection window state. Exists exactly while the connection is
/// tracked.
#[derive(Debug)]
struct ConnectionState {
    ip: IpAddr,
    window_start_ms: u64,
    message_count: u32,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<ConnectionId, Arc<Mutex<ConnectionState>>>,
    by_ip: HashMap<IpAddr, HashSet<ConnectionId>>,
}

/// Connection admission control and per-connection message limiting.
///
/// # Thread Safety
///
/// The connection tables live behind a `tokio::sync::RwLock`. Each
/// connection's window state has its own mutex, so message checks on
/// different connections only ever share the read lock. Cloning is cheap
/// and yields a handle to the same tables.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    tables: Arc<RwLock<Tables>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tables: Arc::new(RwLock::new(Tables::default())),
            clock: system_clock(),
        }
    }

    /// Creates a rate limiter with both limits disabled. Connections are
    /// still tracked.
    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::disabled())
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admits a connection from `ip`.
    ///
    /// # Returns
    ///
    /// `false` without touching any state if the address already holds the
    /// maximum number of connections, `true` once the connection is tracked.
    pub async fn track_connection(&self, id: ConnectionId, ip: IpAddr) -> bool {
        let mut tables = self.tables.write().await;

        let current = tables.by_ip.get(&ip).map_or(0, HashSet::len);
        if self.config.limits_connections() && current >= self.config.max_connections_per_ip as usize {
            warn!(%ip, current, "Connection cap reached, refusing {}", id);
            return false;
        }

        let state = ConnectionState {
            ip,
            window_start_ms: self.clock.now_ms(),
            message_count: 0,
        };
        tables.connections.insert(id, Arc::new(Mutex::new(state)));
        tables.by_ip.entry(ip).or_default().insert(id);
        debug!(%ip, "Tracking {}", id);
        true
    }

    /// Forgets a connection. Unknown ids are ignored.
    pub async fn untrack_connection(&self, id: ConnectionId) {
        let mut tables = self.tables.write().await;
        let Some(state) = tables.connections.remove(&id) else {
            return;
        };
        let ip = lock(&state).ip;
        if let Some(set) = tables.by_ip.get_mut(&ip) {
            set.remove(&id);
            if set.is_empty() {
                tables.by_ip.remove(&ip);
            }
        }
        debug!(%ip, "Untracked {}", id);
    }

    /// Counts one inbound message against the connection's window.
    ///
    /// Untracked connections are always rejected.
    pub async fn check_rate_limit(&self, id: ConnectionId) -> RateLimitResult {
        let Some(state) = self.state(id).await else {
            return RateLimitResult::RateLimited {
                retry_after: self.config.window,
            };
        };

        if !self.config.limits_messages() {
            return RateLimitResult::Allowed;
        }

        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms();
        let mut state = lock(&state);

        if now.saturating_sub(state.window_start_ms) >= window_ms {
            state.window_start_ms = now;
            state.message_count = 1;
            return RateLimitResult::Allowed;
        }

        if state.message_count >= self.config.max_messages_per_window {
            let reset_at = state.window_start_ms.saturating_add(window_ms);
            return RateLimitResult::RateLimited {
                retry_after: Duration::from_millis(reset_at.saturating_sub(now)),
            };
        }

        state.message_count += 1;
        RateLimitResult::Allowed
    }

    /// Returns the connection's quota, or `None` if it is not tracked.
    ///
    /// If the window has already elapsed the full quota is reported, as if
    /// the window had just been reset. With message limiting disabled the
    /// remaining count is `u32::MAX`.
    pub async fn stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        let state = self.state(id).await?;
        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms();
        let state = lock(&state);

        if !self.config.limits_messages() {
            return Some(ConnectionStats {
                message_count: state.message_count,
                remaining_messages: u32::MAX,
                reset_time_ms: now,
            });
        }

        if now.saturating_sub(state.window_start_ms) >= window_ms {
            return Some(ConnectionStats {
                message_count: 0,
                remaining_messages: self.config.max_messages_per_window,
                reset_time_ms: now.saturating_add(window_ms),
            });
        }

        Some(ConnectionStats {
            message_count: state.message_count,
            remaining_messages: self
                .config
                .max_messages_per_window
                .saturating_sub(state.message_count),
            reset_time_ms: state.window_start_ms.saturating_add(window_ms),
        })
    }

    /// Stats in wire form. Untracked connections and disabled limiting both
    /// report the unlimited sentinel.
    pub async fn rpc_stats(&self, id: ConnectionId) -> RpcStats {
        if !self.config.limits_messages() {
            return RpcStats::unlimited();
        }
        match self.stats(id).await {
            Some(stats) => {
                let until_reset = stats.reset_time_ms.saturating_sub(self.clock.now_ms());
                RpcStats::new(
                    i64::from(stats.remaining_messages),
                    until_reset.div_ceil(1000),
                )
            }
            None => RpcStats::unlimited(),
        }
    }

    /// Number of connections currently held by `ip`.
    pub async fn ip_connection_count(&self, ip: IpAddr) -> usize {
        self.tables.read().await.by_ip.get(&ip).map_or(0, HashSet::len)
    }

    /// Number of connections currently tracked.
    pub async fn tracked_connection_count(&self) -> usize {
        self.tables.read().await.connections.len()
    }

    pub async fn is_tracked(&self, id: ConnectionId) -> bool {
        self.tables.read().await.connections.contains_key(&id)
    }

    async fn state(&self, id: ConnectionId) -> Option<Arc<Mutex<ConnectionState>>> {
        self.tables.read().await.connections.get(&id).cloned()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
