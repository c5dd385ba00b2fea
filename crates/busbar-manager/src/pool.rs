// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Keyed connection pool with per-endpoint serialisation.
//!
//! Many consumers share few physical links, and most Modbus slaves tolerate
//! exactly one transaction at a time, so the pool keeps at most one
//! connection per [`EndpointKey`] and hands it to one borrower at a time.
//! Waiters queue FIFO on a fair async mutex; a long-waiting submitter is
//! never starved by later arrivals.
//!
//! Pacing: between returning a connection and handing it (or a fresh one)
//! to the next borrower, at least the endpoint's configured
//! inter-transaction delay elapses. Devices that cannot keep up with
//! back-to-back transactions rely on this.
//!
//! Lifecycle: links are created lazily through the [`LinkFactory`] with a
//! bounded retry budget, optionally closed on return by age
//! (`reconnect_after`) or by an unregister watermark
//! ([`ConnectionPool::disconnect_on_return`]).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use busbar_core::endpoint::{EndpointKey, EndpointPoolConfig};

use crate::link::{Link, LinkFactory};

// =============================================================================
// ConfigMap
// =============================================================================

/// Endpoint configuration registry shared by the manager and the pool.
///
/// Lookups fall back to per-transport defaults; overrides apply from the
/// next borrow.
#[derive(Default)]
pub(crate) struct ConfigMap {
    overrides: DashMap<EndpointKey, EndpointPoolConfig>,
}

impl ConfigMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, endpoint: EndpointKey, config: EndpointPoolConfig) {
        self.overrides.insert(endpoint, config);
    }

    pub(crate) fn effective(&self, endpoint: &EndpointKey) -> EndpointPoolConfig {
        self.overrides
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| EndpointPoolConfig::default_for(endpoint))
    }
}

// =============================================================================
// Borrow failures
// =============================================================================

/// Why a borrow could not produce a connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BorrowError {
    /// The pool was shut down.
    #[error("connection pool is closed")]
    Closed,

    /// The connect retry budget was exhausted.
    #[error("failed to connect after {attempts} attempts: {last}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        last: io::Error,
    },
}

// =============================================================================
// Pool internals
// =============================================================================

/// One live link plus its book-keeping.
struct LiveLink {
    link: Box<dyn Link>,
    established_at: Instant,
}

/// State behind each endpoint's borrow gate.
#[derive(Default)]
struct SlotState {
    link: Option<LiveLink>,
    last_returned_at: Option<Instant>,
    last_connect_attempt: Option<Instant>,
}

impl SlotState {
    fn new() -> Self {
        Self::default()
    }
}

/// Per-endpoint slot: the fair borrow gate plus the unregister watermark.
struct EndpointSlot {
    gate: Arc<AsyncMutex<SlotState>>,
    watermark: parking_lot::Mutex<Option<Instant>>,
}

impl EndpointSlot {
    fn new() -> Self {
        Self {
            gate: Arc::new(AsyncMutex::new(SlotState::new())),
            watermark: parking_lot::Mutex::new(None),
        }
    }
}

// =============================================================================
// ConnectionPool
// =============================================================================

/// The keyed pool. One instance per activated manager.
pub(crate) struct ConnectionPool {
    factory: Arc<dyn LinkFactory>,
    configs: Arc<ConfigMap>,
    slots: DashMap<EndpointKey, Arc<EndpointSlot>>,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub(crate) fn new(factory: Arc<dyn LinkFactory>, configs: Arc<ConfigMap>) -> Self {
        Self {
            factory,
            configs,
            slots: DashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Borrows the endpoint's connection, blocking FIFO behind the current
    /// holder, honouring the inter-transaction delay and creating a link if
    /// none is pooled.
    pub(crate) async fn borrow(&self, endpoint: &EndpointKey) -> Result<PooledConnection, BorrowError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BorrowError::Closed);
        }
        let slot = self
            .slots
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(EndpointSlot::new()))
            .clone();

        let wait_start = Instant::now();
        let mut guard = slot.gate.clone().lock_owned().await;
        trace!(endpoint = %endpoint, waited = ?wait_start.elapsed(), "borrow gate acquired");

        if self.closed.load(Ordering::SeqCst) {
            return Err(BorrowError::Closed);
        }

        let config = self.configs.effective(endpoint);

        // Inter-transaction pacing, measured from the previous return.
        if let Some(returned) = guard.last_returned_at {
            sleep_until(returned + config.passivate_borrow_min).await;
        }

        let live = match guard.link.take() {
            Some(live) => live,
            None => self.establish(endpoint, &config, &mut guard).await?,
        };

        Ok(PooledConnection {
            endpoint: endpoint.clone(),
            config,
            slot,
            pool_closed: Arc::clone(&self.closed),
            guard,
            live: Some(live),
            borrowed_at: Instant::now(),
        })
    }

    /// Creates a link with the configured retry budget.
    async fn establish(
        &self,
        endpoint: &EndpointKey,
        config: &EndpointPoolConfig,
        state: &mut OwnedMutexGuard<SlotState>,
    ) -> Result<LiveLink, BorrowError> {
        let max_tries = config.connect_max_tries.max(1);
        let mut last_error: Option<io::Error> = None;

        for attempt in 1..=max_tries {
            // Space attempts out: an explicit inter-connect delay wins,
            // otherwise exponential backoff with a little jitter.
            if !config.inter_connect_delay.is_zero() {
                if let Some(last) = state.last_connect_attempt {
                    sleep_until(last + config.inter_connect_delay).await;
                }
            } else if attempt > 1 {
                sleep(backoff_delay(attempt - 2)).await;
            }
            state.last_connect_attempt = Some(Instant::now());

            match timeout(config.connect_timeout, self.factory.connect(endpoint, config)).await {
                Ok(Ok(link)) => {
                    debug!(endpoint = %endpoint, attempt, "connected");
                    if !config.after_connect_delay.is_zero() {
                        sleep(config.after_connect_delay).await;
                    }
                    return Ok(LiveLink {
                        link,
                        established_at: Instant::now(),
                    });
                }
                Ok(Err(error)) => {
                    warn!(endpoint = %endpoint, attempt, max_tries, %error, "connect attempt failed");
                    last_error = Some(error);
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, attempt, max_tries, "connect attempt timed out");
                    last_error = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", config.connect_timeout),
                    ));
                }
            }
        }

        Err(BorrowError::ConnectFailed {
            attempts: max_tries,
            last: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connect attempt made")),
        })
    }

    /// Marks connections borrowed before `watermark` to be closed rather
    /// than reused when they come back.
    pub(crate) fn disconnect_on_return(&self, endpoint: &EndpointKey, watermark: Instant) {
        if let Some(slot) = self.slots.get(endpoint) {
            *slot.watermark.lock() = Some(watermark);
            debug!(endpoint = %endpoint, "disconnect-on-return watermark set");
        }
    }

    /// Closes the endpoint's idle connection, if any. An in-flight
    /// connection is left to the watermark.
    pub(crate) fn clear(&self, endpoint: &EndpointKey) {
        if let Some(slot) = self.slots.get(endpoint) {
            if let Ok(mut state) = slot.gate.try_lock() {
                if state.link.take().is_some() {
                    debug!(endpoint = %endpoint, "idle connection cleared");
                }
            }
        }
    }

    /// Shuts the pool down: no further borrows succeed and idle
    /// connections are dropped. In-flight connections are closed as they
    /// come back.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.slots.iter() {
            if let Ok(mut state) = entry.value().gate.try_lock() {
                state.link = None;
            }
        }
        debug!("connection pool closed");
    }
}

/// Exponential connect backoff: 100 ms doubling to a 1 s cap, ±10% jitter.
fn backoff_delay(exponent: u32) -> Duration {
    let base = Duration::from_millis(100)
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(Duration::from_secs(1));
    base.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}

// =============================================================================
// PooledConnection
// =============================================================================

/// A borrowed connection. Holds the endpoint's slot until released.
///
/// Exactly one of [`give_back`](Self::give_back) or
/// [`invalidate`](Self::invalidate) ends the borrow; dropping the handle
/// without either (a cancelled task) closes the link hard, since its wire
/// state is unknown.
pub(crate) struct PooledConnection {
    endpoint: EndpointKey,
    config: EndpointPoolConfig,
    slot: Arc<EndpointSlot>,
    pool_closed: Arc<AtomicBool>,
    guard: OwnedMutexGuard<SlotState>,
    live: Option<LiveLink>,
    borrowed_at: Instant,
}

impl PooledConnection {
    /// The wire link, for exactly one exchange at a time.
    pub(crate) fn link(&mut self) -> &mut dyn Link {
        match self.live.as_mut() {
            Some(live) => live.link.as_mut(),
            None => unreachable!("borrowed connection without live link"),
        }
    }

    /// Config snapshot taken at borrow time.
    pub(crate) fn config(&self) -> &EndpointPoolConfig {
        &self.config
    }

    /// Returns the connection to the pool.
    ///
    /// The connection is closed instead of kept when the unregister
    /// watermark postdates this borrow, when it has outlived
    /// `reconnect_after`, or when the pool has shut down meanwhile.
    pub(crate) async fn give_back(mut self) {
        if let Some(mut live) = self.live.take() {
            let watermark = *self.slot.watermark.lock();
            let stale = watermark.is_some_and(|mark| self.borrowed_at < mark);
            let aged = self
                .config
                .reconnect_after
                .is_some_and(|age| live.established_at.elapsed() >= age);
            if stale || aged || self.pool_closed.load(Ordering::SeqCst) {
                trace!(endpoint = %self.endpoint, stale, aged, "closing connection on return");
                live.link.close().await;
            } else {
                self.guard.link = Some(live);
            }
        }
        self.guard.last_returned_at = Some(Instant::now());
        trace!(endpoint = %self.endpoint, "connection returned");
    }

    /// Closes the connection and removes it from the pool.
    pub(crate) async fn invalidate(mut self) {
        if let Some(mut live) = self.live.take() {
            live.link.close().await;
        }
        self.guard.last_returned_at = Some(Instant::now());
        trace!(endpoint = %self.endpoint, "connection invalidated");
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Only reached with a link still attached when the owning task was
        // cancelled mid-exchange; the wire state is unknown, so the link is
        // dropped hard rather than pooled.
        if self.live.take().is_some() {
            self.guard.last_returned_at = Some(Instant::now());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PlannedExchange, ScriptedFactory};
    use busbar_core::endpoint::EndpointKey;
    use std::time::Duration as StdDuration;

    fn tcp_key() -> EndpointKey {
        EndpointKey::tcp("127.0.0.1", 5020)
    }

    fn pool_with(factory: Arc<ScriptedFactory>, configs: Arc<ConfigMap>) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(factory, configs))
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_reuses_connection_when_kept_open() {
        let key = EndpointKey::serial_rtu("/dev/ttyUSB0", 9600);
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;

        // Serial defaults keep the port open between transactions.
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tcp_default_reconnects_each_transaction() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;

        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_separates_consecutive_borrows() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        let returned_at = Instant::now();

        let _conn = pool.borrow(&key).await.unwrap();
        let gap = Instant::now() - returned_at;
        assert!(
            gap >= StdDuration::from_millis(60),
            "expected >= 60ms between return and borrow, got {gap:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn borrowers_serialise_and_are_served_in_order() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        let configs = Arc::new(ConfigMap::new());
        // Keep the link alive so only ordering is observed.
        configs.set(
            key.clone(),
            EndpointPoolConfig::default_for(&key)
                .with_reconnect_after(None)
                .with_passivate_borrow_min(StdDuration::ZERO),
        );
        let pool = pool_with(factory, configs);

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..3 {
            let pool = Arc::clone(&pool);
            let key = key.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let conn = pool.borrow(&key).await.unwrap();
                order.lock().push(id);
                sleep(StdDuration::from_millis(10)).await;
                conn.give_back().await;
            }));
            // Let each task reach the borrow gate before spawning the next.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_exhaust_budget() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::failing_connects());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        match pool.borrow(&key).await {
            Err(BorrowError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConnectFailed, got {other:?}", other = other.err()),
        }
        assert_eq!(factory.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn watermark_closes_connection_on_return() {
        let key = EndpointKey::serial_rtu("/dev/ttyUSB0", 9600);
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        pool.disconnect_on_return(&key, Instant::now() + StdDuration::from_millis(1));
        conn.give_back().await;

        // The returned link was closed, so the next borrow reconnects.
        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watermark_spares_connections_borrowed_after_it() {
        let key = EndpointKey::serial_rtu("/dev/ttyUSB0", 9600);
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        pool.disconnect_on_return(&key, Instant::now());

        // This borrow postdates the watermark, so returning keeps the link.
        sleep(StdDuration::from_millis(1)).await;
        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_closes_idle_connection() {
        let key = EndpointKey::serial_rtu("/dev/ttyUSB0", 9600);
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(Arc::clone(&factory), Arc::new(ConfigMap::new()));

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        pool.clear(&key);

        let conn = pool.borrow(&key).await.unwrap();
        conn.give_back().await;
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn after_connect_delay_precedes_first_handout() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        let configs = Arc::new(ConfigMap::new());
        configs.set(
            key.clone(),
            EndpointPoolConfig::default_for(&key)
                .with_after_connect_delay(StdDuration::from_millis(500)),
        );
        let pool = pool_with(factory, configs);

        let start = Instant::now();
        let conn = pool.borrow(&key).await.unwrap();
        assert!(
            start.elapsed() >= StdDuration::from_millis(500),
            "borrow returned before the settle delay: {:?}",
            start.elapsed()
        );
        conn.give_back().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pool_rejects_borrows() {
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        let pool = pool_with(factory, Arc::new(ConfigMap::new()));

        pool.close();
        assert!(matches!(pool.borrow(&key).await, Err(BorrowError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn planned_exchange_scripts_reach_the_link() {
        // Sanity-check the scripted factory wiring used across the tests.
        let key = tcp_key();
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![PlannedExchange::ReadRegisters(vec![7])]);
        let pool = pool_with(factory, Arc::new(ConfigMap::new()));

        let mut conn = pool.borrow(&key).await.unwrap();
        let request = busbar_core::frame::ReadRequest::new(
            1,
            busbar_core::frame::ReadFunction::HoldingRegisters,
            0,
            1,
            1,
        )
        .unwrap();
        let payload = conn.link().read(&request).await.unwrap();
        assert_eq!(payload.len(), 1);
        conn.give_back().await;
    }
}
