// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The manager facade: the single externally addressable entity.
//!
//! A [`ModbusManager`] owns the connection pool and the poll registry,
//! accepts task submissions from any thread without blocking, and
//! broadcasts endpoint configuration changes to listeners.
//!
//! # Lifecycle
//!
//! [`activate`](ModbusManager::activate) builds the pool and worker limits
//! on the current tokio runtime; [`deactivate`](ModbusManager::deactivate)
//! unregisters all polls, closes the pool and quiesces the workers. The
//! runtime itself is untouched, so the manager can be re-activated.
//!
//! # Example
//!
//! ```rust,ignore
//! use busbar_core::{EndpointKey, ReadFunction, ReadRequest, ReadTask};
//! use busbar_manager::{ManagerConfig, ModbusManager};
//!
//! let manager = ModbusManager::new();
//! manager.activate(ManagerConfig::default())?;
//!
//! let endpoint = EndpointKey::tcp("192.168.1.9", 502);
//! let request = ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, 3)?;
//! let task = ReadTask::new(endpoint, request, &callback);
//!
//! manager.register_regular_poll(task, Duration::from_millis(500), Duration::ZERO);
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use busbar_core::endpoint::{EndpointKey, EndpointPoolConfig};
use busbar_core::task::{ReadTask, WriteTask};

use crate::executor::{self, CallbackDispatcher, CancelFlag, ExecutorShared, TaskKind};
use crate::link::{LinkFactory, WireLinkFactory};
use crate::pool::{ConfigMap, ConnectionPool};
use crate::scheduler::{spawn_poll_loop, PollRegistry, TaskHandle};

// =============================================================================
// Listener / config / errors
// =============================================================================

/// Observer of manager-wide events.
pub trait ManagerListener: Send + Sync {
    /// An endpoint's pool configuration was set. Called synchronously after
    /// the new configuration has taken effect.
    fn on_endpoint_pool_configuration_set(
        &self,
        endpoint: &EndpointKey,
        config: &EndpointPoolConfig,
    );
}

/// Worker sizing for an activation.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrently executing transactions across all endpoints.
    pub dispatch_workers: usize,
    /// Concurrently running consumer callbacks.
    pub callback_workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 10,
            callback_workers: 5,
        }
    }
}

/// Activation failure.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// `activate` was called outside a tokio runtime.
    #[error("activation requires a running tokio runtime")]
    NoRuntime,
}

// =============================================================================
// ModbusManager
// =============================================================================

/// State present only while the manager is activated.
struct Active {
    pool: Arc<ConnectionPool>,
    shared: Arc<ExecutorShared>,
    runtime: Handle,
}

/// Pools and serialises transactions over Modbus endpoints, schedules
/// periodic and one-off tasks against them, and dispatches decoded results
/// to callbacks.
pub struct ModbusManager {
    factory: Arc<dyn LinkFactory>,
    configs: Arc<ConfigMap>,
    registry: Arc<PollRegistry>,
    listeners: RwLock<Vec<Arc<dyn ManagerListener>>>,
    active: RwLock<Option<Active>>,
}

impl ModbusManager {
    /// Manager over the production wire stack.
    pub fn new() -> Self {
        Self::with_link_factory(Arc::new(WireLinkFactory::new()))
    }

    /// Manager over a custom link factory (tests, exotic transports).
    pub fn with_link_factory(factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            factory,
            configs: Arc::new(ConfigMap::new()),
            registry: Arc::new(PollRegistry::new()),
            listeners: RwLock::new(Vec::new()),
            active: RwLock::new(None),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Activates the manager on the current tokio runtime.
    ///
    /// Idempotent while active. Fails when no runtime is available; the
    /// manager refuses to start without its workers.
    pub fn activate(&self, config: ManagerConfig) -> Result<(), ManagerError> {
        let mut active = self.active.write();
        if active.is_some() {
            debug!("manager already activated");
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.configs),
        ));
        let shared = Arc::new(ExecutorShared {
            pool: Arc::clone(&pool),
            registry: Arc::clone(&self.registry),
            callbacks: CallbackDispatcher::new(config.callback_workers),
            work_permits: Arc::new(Semaphore::new(config.dispatch_workers.max(1))),
        });
        *active = Some(Active {
            pool,
            shared,
            runtime,
        });
        info!("modbus manager activated");
        Ok(())
    }

    /// Deactivates: unregisters every poll, closes the pool and quiesces
    /// the workers. In-flight attempts abort at their next checkpoint.
    pub fn deactivate(&self) {
        let Some(active) = self.active.write().take() else {
            debug!("manager already inactive");
            return;
        };
        for task in self.registry.snapshot() {
            if let Some(handle) = self.registry.remove(&task) {
                handle.abort();
            }
            active.pool.disconnect_on_return(task.endpoint(), Instant::now());
            active.pool.clear(task.endpoint());
        }
        active.shared.callbacks.close();
        active.shared.work_permits.close();
        active.pool.close();
        info!("modbus manager deactivated");
    }

    /// Whether the manager is currently activated.
    pub fn is_active(&self) -> bool {
        self.active.read().is_some()
    }

    // =========================================================================
    // Task submission
    // =========================================================================

    /// Schedules a one-off read for immediate execution.
    ///
    /// Never blocks and never fails: transaction errors reach the task's
    /// callback. Submitting to an inactive manager drops the task with a
    /// log entry.
    pub fn submit_one_time_read(&self, task: ReadTask) -> TaskHandle {
        let guard = self.active.read();
        let Some(active) = guard.as_ref() else {
            debug!(task = %task, "manager inactive; dropping one-off read");
            return TaskHandle::completed();
        };
        let shared = Arc::clone(&active.shared);
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        debug!(task = %task, "one-off read submitted");
        let join = active.runtime.spawn(async move {
            if let Some(delivery) =
                executor::run_read(&shared, &task, TaskKind::OneOff, &flag).await
            {
                let _ = delivery.await;
            }
        });
        TaskHandle::new(cancel, join)
    }

    /// Schedules a one-off write for immediate execution.
    pub fn submit_one_time_write(&self, task: WriteTask) -> TaskHandle {
        let guard = self.active.read();
        let Some(active) = guard.as_ref() else {
            debug!(task = %task, "manager inactive; dropping one-off write");
            return TaskHandle::completed();
        };
        let shared = Arc::clone(&active.shared);
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        debug!(task = %task, "one-off write submitted");
        let join = active.runtime.spawn(async move {
            if let Some(delivery) = executor::run_write(&shared, &task, &flag).await {
                let _ = delivery.await;
            }
        });
        TaskHandle::new(cancel, join)
    }

    // =========================================================================
    // Periodic polls
    // =========================================================================

    /// Registers a fixed-rate poll: executions at `initial_delay + k * period`.
    ///
    /// Registering a task that is already registered cancels the previous
    /// schedule first and installs the new one in its place.
    pub fn register_regular_poll(&self, task: ReadTask, period: Duration, initial_delay: Duration) {
        let guard = self.active.read();
        let Some(active) = guard.as_ref() else {
            warn!(task = %task, "manager inactive; poll not registered");
            return;
        };
        let handle = spawn_poll_loop(
            &active.runtime,
            Arc::clone(&active.shared),
            task.clone(),
            period,
            initial_delay,
        );
        if let Some(previous) = self.registry.install(task.clone(), handle) {
            previous.abort();
            active.pool.disconnect_on_return(task.endpoint(), Instant::now());
            active.pool.clear(task.endpoint());
            debug!(task = %task, "replaced existing poll registration");
        }
        info!(task = %task, ?period, ?initial_delay, "regular poll registered");
    }

    /// Unregisters a poll. Returns `false` when the task was not
    /// registered.
    ///
    /// The poll's connections are marked for disconnect-on-return and idle
    /// ones are closed immediately; an attempt already past its
    /// registration check may still deliver one final callback.
    pub fn unregister_regular_poll(&self, task: &ReadTask) -> bool {
        let Some(handle) = self.registry.remove(task) else {
            warn!(task = %task, "tried to unregister a poll that is not registered");
            return false;
        };
        handle.abort();
        if let Some(active) = self.active.read().as_ref() {
            active.pool.disconnect_on_return(task.endpoint(), Instant::now());
            active.pool.clear(task.endpoint());
        }
        info!(task = %task, "regular poll unregistered");
        true
    }

    /// Snapshot of all registered polls.
    pub fn registered_polls(&self) -> Vec<ReadTask> {
        self.registry.snapshot()
    }

    // =========================================================================
    // Endpoint configuration
    // =========================================================================

    /// Sets an endpoint's pool configuration and notifies listeners
    /// synchronously. Pooled connections survive; the new pacing applies
    /// from the next borrow.
    pub fn set_endpoint_pool_configuration(
        &self,
        endpoint: EndpointKey,
        config: EndpointPoolConfig,
    ) {
        self.configs.set(endpoint.clone(), config.clone());
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_endpoint_pool_configuration_set(&endpoint, &config);
        }
        debug!(endpoint = %endpoint, "endpoint pool configuration set");
    }

    /// The endpoint's effective configuration (explicit or per-transport
    /// default).
    pub fn get_endpoint_pool_configuration(&self, endpoint: &EndpointKey) -> EndpointPoolConfig {
        self.configs.effective(endpoint)
    }

    /// Adds a configuration-change listener.
    pub fn add_listener(&self, listener: Arc<dyn ManagerListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a previously added listener (by identity).
    pub fn remove_listener(&self, listener: &Arc<dyn ManagerListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

impl Default for ModbusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModbusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusManager")
            .field("active", &self.is_active())
            .field("registered_polls", &self.registry.snapshot().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
