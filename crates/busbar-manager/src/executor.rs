// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The transaction executor: one task, up to `max_tries` attempts.
//!
//! Each attempt borrows the endpoint's pooled connection, runs a single
//! request/response exchange and releases the connection exactly once:
//! returned when it is still trustworthy, invalidated when it is not.
//!
//! | failure                  | connection | then    |
//! |--------------------------|------------|---------|
//! | i/o error, timeout       | invalidate | retry   |
//! | slave exception response | keep       | retry   |
//! | transaction id mismatch  | invalidate | retry   |
//! | decode error             | invalidate | retry   |
//! | anything unexpected      | invalidate | retry   |
//!
//! Between attempts at least the endpoint's inter-transaction delay passes,
//! measured from the start of the previous attempt. Periodic polls
//! re-confirm their registration before every attempt so an unregistered
//! poll aborts without touching the consumer. After the final failed
//! attempt only the last error is delivered, on the callback workers so a
//! slow consumer never holds a connection slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};

use busbar_core::endpoint::EndpointKey;
use busbar_core::error::TransactionError;
use busbar_core::frame::{ReadPayload, WriteResponse};
use busbar_core::task::{ReadTask, WriteTask};

use crate::link::Link;
use crate::pool::{BorrowError, ConnectionPool, PooledConnection};
use crate::scheduler::PollRegistry;

// =============================================================================
// CancelFlag
// =============================================================================

/// Cooperative cancellation token, observed at borrow wait and at each
/// retry boundary. The wire exchange itself is never interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, uncancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// CallbackDispatcher
// =============================================================================

/// Bounded callback workers, detached from the transaction path.
pub(crate) struct CallbackDispatcher {
    permits: Arc<Semaphore>,
}

impl CallbackDispatcher {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Stops accepting deliveries; pending ones are dropped.
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    /// Schedules a delivery; returns a handle resolving once it ran.
    ///
    /// Returns `None` when the callback workers are shut down, in which
    /// case the delivery is logged and dropped.
    pub(crate) fn dispatch<F>(&self, deliver: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.permits.is_closed() {
            debug!("callback workers are shut down; dropping delivery");
            return None;
        }
        let permits = Arc::clone(&self.permits);
        Some(tokio::spawn(async move {
            match permits.acquire().await {
                Ok(_permit) => deliver(),
                Err(_) => debug!("callback workers shut down before delivery"),
            }
        }))
    }
}

// =============================================================================
// ExecutorShared
// =============================================================================

/// Everything a single execution needs; one instance per activation.
pub(crate) struct ExecutorShared {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) registry: Arc<PollRegistry>,
    pub(crate) callbacks: CallbackDispatcher,
    /// Bounds concurrently executing transactions (the dispatch workers).
    pub(crate) work_permits: Arc<Semaphore>,
}

/// Whether the execution belongs to a registered periodic poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// One-shot submission.
    OneOff,
    /// Tick of a registered poll; registration is re-checked per attempt.
    Poll,
}

// =============================================================================
// Entry points
// =============================================================================

/// Executes a read task. Returns the delivery handle, if anything was
/// delivered.
pub(crate) async fn run_read(
    shared: &ExecutorShared,
    task: &ReadTask,
    kind: TaskKind,
    cancel: &CancelFlag,
) -> Option<JoinHandle<()>> {
    run(shared, TaskRef::Read(task), kind, cancel).await
}

/// Executes a write task. Returns the delivery handle, if anything was
/// delivered.
pub(crate) async fn run_write(
    shared: &ExecutorShared,
    task: &WriteTask,
    cancel: &CancelFlag,
) -> Option<JoinHandle<()>> {
    run(shared, TaskRef::Write(task), TaskKind::OneOff, cancel).await
}

// =============================================================================
// Retry engine
// =============================================================================

enum TaskRef<'a> {
    Read(&'a ReadTask),
    Write(&'a WriteTask),
}

enum Outcome {
    Read(ReadPayload),
    Write(WriteResponse),
}

impl TaskRef<'_> {
    fn endpoint(&self) -> &EndpointKey {
        match self {
            Self::Read(task) => task.endpoint(),
            Self::Write(task) => task.endpoint(),
        }
    }

    fn max_tries(&self) -> u32 {
        match self {
            Self::Read(task) => task.request().max_tries(),
            Self::Write(task) => task.request().max_tries(),
        }
    }

    fn still_registered(&self, registry: &PollRegistry) -> bool {
        match self {
            Self::Read(task) => registry.is_registered(task),
            // Writes are never periodic.
            Self::Write(_) => true,
        }
    }

    async fn exchange(&self, link: &mut dyn Link) -> Result<Outcome, TransactionError> {
        match self {
            Self::Read(task) => link.read(task.request()).await.map(Outcome::Read),
            Self::Write(task) => link.write(task.request()).await.map(Outcome::Write),
        }
    }

    fn deliver_success(
        &self,
        callbacks: &CallbackDispatcher,
        outcome: Outcome,
    ) -> Option<JoinHandle<()>> {
        match (self, outcome) {
            (Self::Read(task), Outcome::Read(payload)) => {
                let task = (*task).clone();
                callbacks.dispatch(move || {
                    if let Some(callback) = task.callback() {
                        callback.on_read(task.request(), &payload);
                    } else {
                        trace!(task = %task, "consumer gone; read result dropped");
                    }
                })
            }
            (Self::Write(task), Outcome::Write(response)) => {
                let task = (*task).clone();
                callbacks.dispatch(move || {
                    if let Some(callback) = task.callback() {
                        callback.on_write(task.request(), &response);
                    } else {
                        trace!(task = %task, "consumer gone; write result dropped");
                    }
                })
            }
            _ => unreachable!("outcome kind always matches task kind"),
        }
    }

    fn deliver_error(
        &self,
        callbacks: &CallbackDispatcher,
        error: TransactionError,
    ) -> Option<JoinHandle<()>> {
        match self {
            Self::Read(task) => {
                let task = (*task).clone();
                callbacks.dispatch(move || {
                    if let Some(callback) = task.callback() {
                        callback.on_error(task.request(), &error);
                    } else {
                        trace!(task = %task, "consumer gone; error dropped");
                    }
                })
            }
            Self::Write(task) => {
                let task = (*task).clone();
                callbacks.dispatch(move || {
                    if let Some(callback) = task.callback() {
                        callback.on_error(task.request(), &error);
                    } else {
                        trace!(task = %task, "consumer gone; error dropped");
                    }
                })
            }
        }
    }
}

impl std::fmt::Display for TaskRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(task) => std::fmt::Display::fmt(task, f),
            Self::Write(task) => std::fmt::Display::fmt(task, f),
        }
    }
}

/// Borrows a connection, delivering `ConnectionFailed` when the endpoint is
/// unreachable. `None` aborts the execution.
async fn borrow_or_report(
    shared: &ExecutorShared,
    task: &TaskRef<'_>,
    operation_id: &str,
) -> Result<PooledConnection, Option<JoinHandle<()>>> {
    match shared.pool.borrow(task.endpoint()).await {
        Ok(connection) => Ok(connection),
        Err(BorrowError::Closed) => {
            debug!(op = operation_id, task = %task, "pool closed; aborting");
            Err(None)
        }
        Err(error) => {
            warn!(op = operation_id, task = %task, %error, "could not connect; aborting");
            Err(task.deliver_error(
                &shared.callbacks,
                TransactionError::connection_failed(task.endpoint().clone()),
            ))
        }
    }
}

async fn run(
    shared: &ExecutorShared,
    task: TaskRef<'_>,
    kind: TaskKind,
    cancel: &CancelFlag,
) -> Option<JoinHandle<()>> {
    let operation_id = operation_id();
    let max_tries = task.max_tries().max(1);

    let _work_permit = match Arc::clone(&shared.work_permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            debug!(op = %operation_id, task = %task, "dispatch workers shut down; aborting");
            return None;
        }
    };

    if cancel.is_cancelled() {
        debug!(op = %operation_id, task = %task, "cancelled before start");
        return None;
    }
    if kind == TaskKind::Poll && !task.still_registered(&shared.registry) {
        debug!(op = %operation_id, task = %task, "poll unregistered before start");
        return None;
    }

    let mut held = match borrow_or_report(shared, &task, &operation_id).await {
        Ok(connection) => Some(connection),
        Err(delivery) => return delivery,
    };

    let mut last_error: Option<TransactionError> = None;
    let mut try_index: u32 = 0;
    let mut last_attempt_start = Instant::now();

    while try_index < max_tries {
        let Some(mut connection) = held.take() else {
            break;
        };

        if cancel.is_cancelled() {
            debug!(op = %operation_id, task = %task, "cancelled; releasing connection");
            connection.give_back().await;
            return None;
        }
        if kind == TaskKind::Poll && !task.still_registered(&shared.registry) {
            debug!(op = %operation_id, task = %task, "poll unregistered mid-flight; aborting");
            connection.give_back().await;
            return None;
        }

        if try_index > 0 {
            // Give the slave breathing room between attempts on the same
            // link, measured from the previous attempt's start.
            let passivate = connection.config().passivate_borrow_min;
            sleep_until(last_attempt_start + passivate).await;
        }
        try_index += 1;
        last_attempt_start = Instant::now();
        trace!(op = %operation_id, task = %task, try_index, max_tries, "attempt starting");

        match task.exchange(connection.link()).await {
            Ok(outcome) => {
                connection.give_back().await;
                trace!(op = %operation_id, task = %task, try_index, "attempt succeeded");
                return task.deliver_success(&shared.callbacks, outcome);
            }
            Err(transaction_error) => {
                let reset = transaction_error.invalidates_connection();
                if try_index < max_tries {
                    warn!(
                        op = %operation_id,
                        task = %task,
                        try_index,
                        max_tries,
                        error = %transaction_error,
                        reset,
                        "attempt failed; will retry"
                    );
                } else {
                    error!(
                        op = %operation_id,
                        task = %task,
                        try_index,
                        error = %transaction_error,
                        reset,
                        "last attempt failed; aborting"
                    );
                }

                if reset {
                    connection.invalidate().await;
                    last_error = Some(transaction_error);
                    if try_index < max_tries {
                        match borrow_or_report(shared, &task, &operation_id).await {
                            Ok(connection) => held = Some(connection),
                            Err(delivery) => return delivery,
                        }
                    }
                } else {
                    last_error = Some(transaction_error);
                    held = Some(connection);
                }
            }
        }
    }

    if let Some(connection) = held.take() {
        connection.give_back().await;
    }
    match last_error {
        Some(error) => task.deliver_error(&shared.callbacks, error),
        None => None,
    }
}

/// Short random id correlating all log lines of one execution.
fn operation_id() -> String {
    let id: u32 = rand::thread_rng().gen();
    format!("{id:08x}")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConfigMap;
    use crate::testing::{PlannedExchange, RecordingReadCallback, RecordingWriteCallback, ScriptedFactory};
    use busbar_core::endpoint::EndpointPoolConfig;
    use busbar_core::frame::{ReadFunction, ReadRequest, WriteCoilRequest, WriteRequest};
    use busbar_core::task::{ReadCallback, WriteCallback};
    use std::time::Duration;

    fn key() -> EndpointKey {
        EndpointKey::tcp("127.0.0.1", 5020)
    }

    fn shared_with(factory: Arc<ScriptedFactory>) -> (ExecutorShared, Arc<ConfigMap>) {
        let configs = Arc::new(ConfigMap::new());
        let pool = Arc::new(ConnectionPool::new(factory, Arc::clone(&configs)));
        let shared = ExecutorShared {
            pool,
            registry: Arc::new(PollRegistry::new()),
            callbacks: CallbackDispatcher::new(5),
            work_permits: Arc::new(Semaphore::new(10)),
        };
        (shared, configs)
    }

    fn read_task(callback: &Arc<dyn ReadCallback>, max_tries: u32) -> ReadTask {
        let request =
            ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, max_tries).unwrap();
        ReadTask::new(key(), request, callback)
    }

    async fn run_and_settle(
        shared: &ExecutorShared,
        task: &ReadTask,
        kind: TaskKind,
    ) {
        if let Some(delivery) = run_read(shared, task, kind, &CancelFlag::new()).await {
            let _ = delivery.await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_delivers_registers() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![PlannedExchange::ReadRegisters(vec![0x1234, 0x5678])]);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 1);
        let reads = recorder.reads();
        assert_eq!(reads.len(), 1);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_consumes_exact_retry_budget() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.set_default_exchange(PlannedExchange::Io);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 3);
        assert_eq!(recorder.errors(), vec!["io".to_string()]);
        assert!(recorder.reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slave_exceptions_keep_the_connection() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![
            PlannedExchange::SlaveException(2),
            PlannedExchange::SlaveException(2),
            PlannedExchange::ReadRegisters(vec![1]),
        ]);
        let (shared, configs) = shared_with(Arc::clone(&factory));
        // Keep the link open so connect counting observes reuse.
        configs.set(
            key(),
            EndpointPoolConfig::default_for(&key())
                .with_reconnect_after(None)
                .with_passivate_borrow_min(Duration::from_millis(1)),
        );

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 3);
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(recorder.reads().len(), 1);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn io_error_reconnects_then_succeeds() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![
            PlannedExchange::Io,
            PlannedExchange::ReadRegisters(vec![1]),
        ]);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 2);
        // One connect for the first borrow, one for the re-borrow after
        // invalidation.
        assert_eq!(factory.connect_count(), 2);
        assert_eq!(recorder.reads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_id_mismatch_reports_the_last_error() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.set_default_exchange(PlannedExchange::IdMismatch);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 3);
        assert_eq!(factory.connect_count(), 3);
        assert_eq!(recorder.errors(), vec!["transaction-id".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_error_resets_the_connection_and_retries() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![
            PlannedExchange::Decode,
            PlannedExchange::ReadRegisters(vec![1]),
        ]);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 2);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 2);
        assert_eq!(factory.connect_count(), 2);
        assert_eq!(recorder.reads().len(), 1);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_reports_connection_failed() {
        let factory = Arc::new(ScriptedFactory::failing_connects());
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        run_and_settle(&shared, &task, TaskKind::OneOff).await;

        assert_eq!(factory.exchange_count(), 0);
        assert_eq!(recorder.errors(), vec!["connection".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_poll_aborts_without_callback() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        // Task is not in the registry, so a poll-kind run aborts.
        run_and_settle(&shared, &task, TaskKind::Poll).await;

        assert_eq!(factory.exchange_count(), 0);
        assert_eq!(recorder.delivery_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_loses_delivery_silently() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![PlannedExchange::ReadRegisters(vec![1])]);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let task = {
            let callback: Arc<dyn ReadCallback> = Arc::new(RecordingReadCallback::new());
            read_task(&callback, 3)
        };

        // Executes fine even though the consumer is gone.
        run_and_settle(&shared, &task, TaskKind::OneOff).await;
        assert_eq!(factory.exchange_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_releases_the_slot_without_callback() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingReadCallback::new());
        let callback: Arc<dyn ReadCallback> = recorder.clone();
        let task = read_task(&callback, 3);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let delivery = run_read(&shared, &task, TaskKind::OneOff, &cancel).await;
        assert!(delivery.is_none());
        assert_eq!(factory.exchange_count(), 0);
        assert_eq!(recorder.delivery_count(), 0);

        // The slot is free for the next borrower.
        let conn = shared.pool.borrow(&key()).await.unwrap();
        conn.give_back().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_coil_acknowledgement_reaches_callback() {
        let factory = Arc::new(ScriptedFactory::always_ok());
        factory.plan_exchanges(vec![PlannedExchange::WriteOk]);
        let (shared, _) = shared_with(Arc::clone(&factory));

        let recorder = Arc::new(RecordingWriteCallback::new());
        let callback: Arc<dyn WriteCallback> = recorder.clone();
        let request = WriteRequest::Coil(WriteCoilRequest::single(1, 10, true, 3).unwrap());
        let task = WriteTask::new(key(), request, &callback);

        if let Some(delivery) = run_write(&shared, &task, &CancelFlag::new()).await {
            let _ = delivery.await;
        }

        let writes = recorder.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].function_code, 5);
    }
}
