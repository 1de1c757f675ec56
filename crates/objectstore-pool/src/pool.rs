//! Reference-counted connection pool.
//!
//! Every connection string maps to at most one open connection, shared by all
//! current leases. When the last lease is released, the connection stays open
//! for the configured idle grace period before a background sweep closes it,
//! so back-to-back borrow/return cycles reuse the same connection.
//!
//! Leases remember the thread that took them. The sweep force-closes a
//! connection whose remaining holders all belong to threads that have exited
//! without releasing it.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use objectstore_core::{DatabaseProvider, DbConnection, Error, PoolErrorKind, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;

thread_local! {
    static HOLDER: Arc<()> = Arc::new(());
}

fn holder_token() -> Weak<()> {
    HOLDER.with(Arc::downgrade)
}

type SharedConnection = Arc<Mutex<Box<dyn DbConnection>>>;

#[derive(Default)]
struct SlotState {
    connection: Option<SharedConnection>,
    holders: Vec<(u64, Weak<()>)>,
    idle_since: Option<Instant>,
}

impl SlotState {
    fn refs(&self) -> usize {
        self.holders.len()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connection strings with an open connection
    pub open_connections: usize,
    /// Outstanding leases across all connections
    pub leases: usize,
    /// Open connections without leases, waiting out their grace period
    pub idle_connections: usize,
}

struct PoolShared {
    provider: Arc<dyn DatabaseProvider>,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Arc<Mutex<SlotState>>>>,
    next_lease: AtomicU64,
    closed: Mutex<bool>,
    wake: Condvar,
}

impl PoolShared {
    fn slot(&self, connection_string: &str) -> Arc<Mutex<SlotState>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(connection_string.to_string()).or_default())
    }

    fn snapshot(&self) -> Vec<(String, Arc<Mutex<SlotState>>)> {
        self.slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    fn release(&self, connection_string: &str, lease: u64) {
        let slot = self.slot(connection_string);
        let mut state = slot.lock();
        let before = state.refs();
        state.holders.retain(|(id, _)| *id != lease);
        if before != state.refs() && state.refs() == 0 {
            state.idle_since = Some(Instant::now());
            debug!(connection_string, "connection idle");
            drop(state);
            self.wake.notify_all();
        }
    }

    // Closes expired idle connections and connections held only by dead
    // threads. Returns how many were closed.
    fn sweep(&self) -> usize {
        let grace = self.config.idle_grace_duration();
        let mut closed = 0;
        for (connection_string, slot) in self.snapshot() {
            let connection = {
                let mut state = slot.lock();
                if state.connection.is_none() {
                    continue;
                }
                if state.refs() > 0 {
                    let before = state.refs();
                    state.holders.retain(|(_, holder)| holder.strong_count() > 0);
                    if state.refs() > 0 {
                        continue;
                    }
                    warn!(
                        connection_string = %connection_string,
                        leaked = before,
                        "holders of connection exited without releasing it; force closing"
                    );
                } else if state.idle_since.is_some_and(|since| since.elapsed() < grace) {
                    continue;
                }
                state.idle_since = None;
                state.connection.take()
            };
            if let Some(connection) = connection {
                close(&connection_string, &connection);
                closed += 1;
            }
        }
        closed
    }

    fn close_all(&self) {
        for (connection_string, slot) in self.snapshot() {
            let connection = {
                let mut state = slot.lock();
                state.holders.clear();
                state.idle_since = None;
                state.connection.take()
            };
            if let Some(connection) = connection {
                close(&connection_string, &connection);
            }
        }
    }
}

fn close(connection_string: &str, connection: &SharedConnection) {
    match connection.lock().close() {
        Ok(()) => info!(connection_string, "closed connection"),
        Err(e) => warn!(connection_string, error = %e, "closing connection failed"),
    }
}

/// Shared, reference-counted connections of one provider.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(provider: Arc<dyn DatabaseProvider>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                provider,
                config,
                slots: Mutex::new(HashMap::new()),
                next_lease: AtomicU64::new(1),
                closed: Mutex::new(false),
                wake: Condvar::new(),
            }),
            reaper: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> &Arc<dyn DatabaseProvider> {
        &self.shared.provider
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease the connection of `connection_string`, opening it on first use.
    #[instrument(level = "debug", skip(self))]
    pub fn acquire(&self, connection_string: &str) -> Result<PooledConnection> {
        if *self.shared.closed.lock() {
            return Err(Error::pool(PoolErrorKind::Closed, "connection pool is shut down"));
        }
        self.ensure_reaper()?;

        let slot = self.shared.slot(connection_string);
        let mut state = slot.lock();
        let connection = match &state.connection {
            Some(connection) => Arc::clone(connection),
            None => {
                let mut opened = self.shared.provider.connect(connection_string)?;
                self.shared.provider.on_connection_opened(opened.as_mut())?;
                info!(
                    provider = self.shared.provider.name(),
                    connection_string, "opened connection"
                );
                let connection = Arc::new(Mutex::new(opened));
                state.connection = Some(Arc::clone(&connection));
                connection
            }
        };
        let lease = self.shared.next_lease.fetch_add(1, Ordering::Relaxed);
        state.holders.push((lease, holder_token()));
        state.idle_since = None;
        Ok(PooledConnection {
            pool: Arc::clone(&self.shared),
            connection_string: connection_string.to_string(),
            connection,
            lease,
            _thread_bound: PhantomData,
        })
    }

    /// Run a sweep now. Returns the number of connections closed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for (_, slot) in self.shared.snapshot() {
            let state = slot.lock();
            if state.connection.is_some() {
                stats.open_connections += 1;
                stats.leases += state.refs();
                if state.refs() == 0 {
                    stats.idle_connections += 1;
                }
            }
        }
        stats
    }

    /// Close every connection and refuse new leases.
    pub fn shutdown(&self) {
        {
            let mut closed = self.shared.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.shared.wake.notify_all();
        if let Some(reaper) = self.reaper.lock().take() {
            if reaper.join().is_err() {
                warn!("connection sweep thread panicked");
            }
        }
        self.shared.close_all();
        info!(provider = self.shared.provider.name(), "connection pool shut down");
    }

    fn ensure_reaper(&self) -> Result<()> {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("objectstore-pool-sweep".into())
            .spawn(move || reap(&shared))
            .map_err(|e| Error::pool(PoolErrorKind::Closed, format!("cannot start sweep thread: {}", e)))?;
        *reaper = Some(handle);
        Ok(())
    }
}

fn reap(shared: &PoolShared) {
    let interval = shared.config.sweep_interval_duration();
    loop {
        {
            let mut closed = shared.closed.lock();
            if *closed {
                return;
            }
            shared.wake.wait_for(&mut closed, interval);
            if *closed {
                return;
            }
        }
        shared.sweep();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("provider", &self.shared.provider.name())
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A lease on a pooled connection. Released on drop.
///
/// Leases stay on the thread that acquired them; the dead-holder sweep is
/// keyed by that thread.
pub struct PooledConnection {
    pool: Arc<PoolShared>,
    connection_string: String,
    connection: SharedConnection,
    lease: u64,
    _thread_bound: PhantomData<*const ()>,
}

impl PooledConnection {
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Exclusive access to the underlying connection.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn DbConnection>> {
        self.connection.lock()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(&self.connection_string, self.lease);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_string", &self.connection_string)
            .field("lease", &self.lease)
            .finish()
    }
}
