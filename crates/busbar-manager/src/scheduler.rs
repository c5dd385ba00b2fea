// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Poll registry and fixed-rate poll loops.
//!
//! Registered polls are keyed by task identity. Installing a schedule for a
//! task that is already registered atomically replaces the previous one,
//! and the executor re-checks the registry before every attempt, so an
//! unregistered poll stops promptly: at most one callback from an attempt
//! already past its registration check can still arrive.
//!
//! Fixed-rate semantics: nominal ticks are `initial_delay + k * period`.
//! When an execution overruns, missed ticks fire back-to-back (burst
//! catch-up) but never concurrently: the loop awaits each execution, and
//! the pool serialises the endpoint regardless.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use busbar_core::task::ReadTask;

use crate::executor::{self, CancelFlag, ExecutorShared, TaskKind};

// =============================================================================
// PollRegistry
// =============================================================================

/// The set of registered periodic polls and their loop handles.
pub(crate) struct PollRegistry {
    polls: DashMap<ReadTask, JoinHandle<()>>,
}

impl PollRegistry {
    pub(crate) fn new() -> Self {
        Self {
            polls: DashMap::new(),
        }
    }

    /// Whether the task is currently registered.
    pub(crate) fn is_registered(&self, task: &ReadTask) -> bool {
        self.polls.contains_key(task)
    }

    /// Installs a schedule, returning the replaced loop handle if the task
    /// was already registered. Per-key atomic.
    pub(crate) fn install(&self, task: ReadTask, handle: JoinHandle<()>) -> Option<JoinHandle<()>> {
        self.polls.insert(task, handle)
    }

    /// Removes a registration, returning its loop handle.
    pub(crate) fn remove(&self, task: &ReadTask) -> Option<JoinHandle<()>> {
        self.polls.remove(task).map(|(_, handle)| handle)
    }

    /// Snapshot of all registered tasks.
    pub(crate) fn snapshot(&self) -> Vec<ReadTask> {
        self.polls.iter().map(|entry| entry.key().clone()).collect()
    }
}

// =============================================================================
// Poll loop
// =============================================================================

/// Spawns the fixed-rate loop driving a registered poll.
pub(crate) fn spawn_poll_loop(
    runtime: &Handle,
    shared: Arc<ExecutorShared>,
    task: ReadTask,
    period: Duration,
    initial_delay: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticks = interval_at(Instant::now() + initial_delay, period.max(Duration::from_millis(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Burst);
        // Poll loops are stopped through the registry (and abort), not
        // through a per-run flag.
        let cancel = CancelFlag::new();
        debug!(task = %task, ?period, ?initial_delay, "poll loop started");
        loop {
            ticks.tick().await;
            if !shared.registry.is_registered(&task) {
                trace!(task = %task, "poll no longer registered; loop ending");
                break;
            }
            if let Some(delivery) = executor::run_read(&shared, &task, TaskKind::Poll, &cancel).await
            {
                // The k-th delivery lands before the (k+1)-th execution is
                // scheduled.
                let _ = delivery.await;
            }
        }
    })
}

// =============================================================================
// TaskHandle
// =============================================================================

/// Handle to a submitted one-off task.
pub struct TaskHandle {
    cancel: CancelFlag,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(cancel: CancelFlag, join: JoinHandle<()>) -> Self {
        Self {
            cancel,
            join: Some(join),
        }
    }

    /// A handle to a task that was never started (e.g. manager inactive).
    pub(crate) fn completed() -> Self {
        Self {
            cancel: CancelFlag::new(),
            join: None,
        }
    }

    /// Requests cancellation. A task that has not started will not start;
    /// an in-flight attempt finishes its wire exchange and then aborts at
    /// the next retry boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has finished (delivered, aborted or never started).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the task to finish, including callback delivery.
    pub async fn join(self) {
        if let Some(join) = self.join {
            let _ = join.await;
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use busbar_core::endpoint::EndpointKey;
    use busbar_core::error::TransactionError;
    use busbar_core::frame::{ReadFunction, ReadPayload, ReadRequest};
    use busbar_core::task::ReadCallback;

    struct NullCallback;

    impl ReadCallback for NullCallback {
        fn on_read(&self, _request: &ReadRequest, _payload: &ReadPayload) {}
        fn on_error(&self, _request: &ReadRequest, _error: &TransactionError) {}
    }

    fn task(reference: u16) -> (ReadTask, Arc<dyn ReadCallback>) {
        let callback: Arc<dyn ReadCallback> = Arc::new(NullCallback);
        let request = ReadRequest::new(1, ReadFunction::HoldingRegisters, reference, 1, 1).unwrap();
        (
            ReadTask::new(EndpointKey::tcp("127.0.0.1", 5020), request, &callback),
            callback,
        )
    }

    #[tokio::test]
    async fn install_replaces_previous_registration() {
        let registry = PollRegistry::new();
        let (poll, _cb) = task(100);

        let first = tokio::spawn(async {});
        assert!(registry.install(poll.clone(), first).is_none());
        assert!(registry.is_registered(&poll));

        let second = tokio::spawn(async {});
        let replaced = registry.install(poll.clone(), second);
        assert!(replaced.is_some());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_task_is_none() {
        let registry = PollRegistry::new();
        let (poll, _cb) = task(100);
        assert!(registry.remove(&poll).is_none());
        assert!(!registry.is_registered(&poll));
    }

    #[tokio::test]
    async fn completed_handle_is_finished() {
        let handle = TaskHandle::completed();
        assert!(handle.is_finished());
        handle.join().await;
    }
}
