//! Bounded connection pool.
//!
//! ## Design
//!
//! - Connections are created lazily by a [`Connector`] on first checkout
//! - `max_active` bounds open connections (idle + checked out); 0 = unbounded
//! - At most `max_idle` connections are kept idle; extras are closed on return
//! - Idle connections older than `idle_timeout` and any connection older than
//!   `max_lifetime` are evicted
//! - A checkout that finds the pool exhausted either waits or fails fast
//! - A connection marked broken with [`PooledConnection::discard`] is closed
//!   instead of returned

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

/// Creates new connections for a [`Pool`].
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection, PoolError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool exhausted ({max_active} active connections)")]
    Exhausted { max_active: usize },

    #[error("failed to open connection: {0}")]
    Dial(String),

    #[error("connection pool poisoned")]
    Poisoned,
}

/// Pool sizing and eviction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_idle: usize,
    /// 0 = unbounded.
    pub max_active: usize,
    /// `None` = idle connections never time out.
    pub idle_timeout: Option<Duration>,
    /// `None` = connections are never recycled for age.
    pub max_lifetime: Option<Duration>,
    /// Wait for a connection when exhausted instead of failing.
    pub wait: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 0,
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: None,
            wait: true,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or checked out.
    pub active: usize,
    pub idle: usize,
}

struct IdleConn<T> {
    conn: T,
    created_at: Instant,
    returned_at: Instant,
}

struct PoolState<T> {
    idle: VecDeque<IdleConn<T>>,
    active: usize,
}

struct PoolInner<C: Connector> {
    connector: C,
    options: PoolOptions,
    state: Mutex<PoolState<C::Connection>>,
    available: Condvar,
}

/// Thread-safe pool; clones share the same connections.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool. No connection is opened until the first checkout.
    pub fn new(connector: C, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                options,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> PoolStats {
        match self.inner.state.lock() {
            Ok(state) => PoolStats {
                active: state.active,
                idle: state.idle.len(),
            },
            Err(_) => PoolStats::default(),
        }
    }

    /// Check out a connection, reusing an idle one when possible.
    pub fn get(&self) -> Result<PooledConnection<C>, PoolError> {
        let options = &self.inner.options;
        let mut state = self.lock()?;

        loop {
            self.evict_stale(&mut state, Instant::now());

            // Most recently returned first; stale ones sit at the front.
            if let Some(idle) = state.idle.pop_back() {
                return Ok(self.wrap(idle.conn, idle.created_at));
            }

            if options.max_active == 0 || state.active < options.max_active {
                state.active += 1;
                drop(state);
                return self.dial();
            }

            if !options.wait {
                return Err(PoolError::Exhausted {
                    max_active: options.max_active,
                });
            }

            state = self
                .inner
                .available
                .wait(state)
                .map_err(|_| PoolError::Poisoned)?;
        }
    }

    fn dial(&self) -> Result<PooledConnection<C>, PoolError> {
        match self.inner.connector.connect() {
            Ok(conn) => Ok(self.wrap(conn, Instant::now())),
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    fn wrap(&self, conn: C::Connection, created_at: Instant) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            created_at,
            broken: false,
            pool: self.clone(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState<C::Connection>>, PoolError> {
        self.inner.state.lock().map_err(|_| PoolError::Poisoned)
    }

    fn expired(&self, created_at: Instant, now: Instant) -> bool {
        self.inner
            .options
            .max_lifetime
            .is_some_and(|lifetime| now.duration_since(created_at) >= lifetime)
    }

    fn evict_stale(&self, state: &mut PoolState<C::Connection>, now: Instant) {
        let idle_timeout = self.inner.options.idle_timeout;
        let before = state.idle.len();

        state.idle.retain(|idle| {
            let timed_out =
                idle_timeout.is_some_and(|t| now.duration_since(idle.returned_at) >= t);
            !timed_out && !self.expired(idle.created_at, now)
        });

        let evicted = before - state.idle.len();
        if evicted > 0 {
            state.active -= evicted;
            debug!(evicted, "closed stale pooled connections");
            // Freed slots may let more than one waiter dial.
            self.inner.available.notify_all();
        }
    }

    fn release_slot(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.active = state.active.saturating_sub(1);
        }
        self.inner.available.notify_one();
    }

    fn put(&self, conn: C::Connection, created_at: Instant, broken: bool) {
        let now = Instant::now();
        if broken || self.expired(created_at, now) {
            drop(conn);
            self.release_slot();
            return;
        }

        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        state.idle.push_back(IdleConn {
            conn,
            created_at,
            returned_at: now,
        });
        while state.idle.len() > self.inner.options.max_idle {
            state.idle.pop_front();
            state.active -= 1;
        }
        drop(state);
        self.inner.available.notify_one();
    }
}

/// A checked-out connection; returns itself to the pool on drop.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    created_at: Instant,
    broken: bool,
    pool: Pool<C>,
}

impl<C: Connector> PooledConnection<C> {
    /// Close this connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, self.created_at, self.broken);
        }
    }
}
