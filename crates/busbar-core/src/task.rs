// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Tasks bind a request to an endpoint and a consumer callback.
//!
//! Callbacks are held weakly: a consumer that is torn down mid-poll does not
//! have its lifetime extended by the scheduler, and a vanished callback
//! silently drops result delivery without ever blocking task execution.
//!
//! Task equality (and hashing) covers the endpoint, the request, and the
//! *identity* of the callback. The scheduler keys its poll registry on this,
//! so re-registering an equal task replaces the previous schedule.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::endpoint::EndpointKey;
use crate::error::TransactionError;
use crate::frame::{ReadPayload, ReadRequest, WriteRequest, WriteResponse};

// =============================================================================
// Callback traits
// =============================================================================

/// Consumer interface for read results.
///
/// Invoked on the manager's callback workers; implementations may block
/// without holding up the endpoint's connection slot.
pub trait ReadCallback: Send + Sync {
    /// A read completed; `payload` carries registers or bits depending on
    /// the function code.
    fn on_read(&self, request: &ReadRequest, payload: &ReadPayload);

    /// All attempts failed; `error` is the last error observed.
    fn on_error(&self, request: &ReadRequest, error: &TransactionError);
}

/// Consumer interface for write results.
pub trait WriteCallback: Send + Sync {
    /// The slave acknowledged the write.
    fn on_write(&self, request: &WriteRequest, response: &WriteResponse);

    /// All attempts failed; `error` is the last error observed.
    fn on_error(&self, request: &WriteRequest, error: &TransactionError);
}

// =============================================================================
// ReadTask
// =============================================================================

/// A read request bound to an endpoint and a weakly-held callback.
#[derive(Clone)]
pub struct ReadTask {
    endpoint: EndpointKey,
    request: ReadRequest,
    callback: Weak<dyn ReadCallback>,
}

impl ReadTask {
    /// Builds a task; the callback is downgraded and held weakly.
    pub fn new(endpoint: EndpointKey, request: ReadRequest, callback: &Arc<dyn ReadCallback>) -> Self {
        Self {
            endpoint,
            request,
            callback: Arc::downgrade(callback),
        }
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    /// The read blueprint.
    pub fn request(&self) -> &ReadRequest {
        &self.request
    }

    /// Upgrades the callback, if the consumer is still alive.
    pub fn callback(&self) -> Option<Arc<dyn ReadCallback>> {
        self.callback.upgrade()
    }
}

impl PartialEq for ReadTask {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.request == other.request
            && Weak::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for ReadTask {}

impl Hash for ReadTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
        self.request.hash(state);
        (Weak::as_ptr(&self.callback) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for ReadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTask")
            .field("endpoint", &self.endpoint)
            .field("request", &self.request)
            .field("callback_alive", &(self.callback.strong_count() > 0))
            .finish()
    }
}

impl fmt::Display for ReadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.request, self.endpoint)
    }
}

// =============================================================================
// WriteTask
// =============================================================================

/// A write request bound to an endpoint and a weakly-held callback.
#[derive(Clone)]
pub struct WriteTask {
    endpoint: EndpointKey,
    request: WriteRequest,
    callback: Weak<dyn WriteCallback>,
}

impl WriteTask {
    /// Builds a task; the callback is downgraded and held weakly.
    pub fn new(
        endpoint: EndpointKey,
        request: WriteRequest,
        callback: &Arc<dyn WriteCallback>,
    ) -> Self {
        Self {
            endpoint,
            request,
            callback: Arc::downgrade(callback),
        }
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    /// The write blueprint.
    pub fn request(&self) -> &WriteRequest {
        &self.request
    }

    /// Upgrades the callback, if the consumer is still alive.
    pub fn callback(&self) -> Option<Arc<dyn WriteCallback>> {
        self.callback.upgrade()
    }
}

impl PartialEq for WriteTask {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.request == other.request
            && Weak::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for WriteTask {}

impl Hash for WriteTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
        self.request.hash(state);
        (Weak::as_ptr(&self.callback) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for WriteTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTask")
            .field("endpoint", &self.endpoint)
            .field("request", &self.request)
            .field("callback_alive", &(self.callback.strong_count() > 0))
            .finish()
    }
}

impl fmt::Display for WriteTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.request, self.endpoint)
    }
}

// =============================================================================
// Tests
// =============================================================================
