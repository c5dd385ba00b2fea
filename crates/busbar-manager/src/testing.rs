// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Scripted links and recording callbacks for tests.
//!
//! The [`ScriptedFactory`] plugs into the manager at the [`LinkFactory`]
//! seam and plays back planned connect and exchange outcomes, so retry and
//! scheduling behaviour can be exercised without sockets or slaves.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use busbar_core::endpoint::{EndpointKey, EndpointPoolConfig};
use busbar_core::error::TransactionError;
use busbar_core::frame::{
    BitArray, ReadPayload, ReadRequest, RegisterArray, WriteRequest, WriteResponse,
};
use busbar_core::task::{ReadCallback, WriteCallback};

use crate::link::{Link, LinkFactory};

// =============================================================================
// Planned outcomes
// =============================================================================

/// Outcome of one planned wire exchange.
#[derive(Debug, Clone)]
pub enum PlannedExchange {
    /// Read succeeds with these registers.
    ReadRegisters(Vec<u16>),
    /// Read succeeds with these bits.
    ReadBits(Vec<bool>),
    /// Write succeeds.
    WriteOk,
    /// The link dies with an i/o error.
    Io,
    /// The slave answers with an exception PDU carrying this code.
    SlaveException(u8),
    /// The response transaction id does not match.
    IdMismatch,
    /// The response frame is malformed.
    Decode,
}

impl PlannedExchange {
    fn into_read_result(self, request: &ReadRequest) -> Result<ReadPayload, TransactionError> {
        match self {
            Self::ReadRegisters(registers) => {
                Ok(ReadPayload::Registers(RegisterArray::new(registers)))
            }
            Self::ReadBits(bits) => {
                let count = bits.len();
                Ok(ReadPayload::Bits(BitArray::from_wire(bits, count)))
            }
            Self::WriteOk => panic!("planned a write outcome for a read exchange"),
            other => Err(other.into_error(request.function().code())),
        }
    }

    fn into_write_result(self, request: &WriteRequest) -> Result<WriteResponse, TransactionError> {
        match self {
            Self::WriteOk => Ok(WriteResponse {
                function_code: request.function().code(),
            }),
            Self::ReadRegisters(_) | Self::ReadBits(_) => {
                panic!("planned a read outcome for a write exchange")
            }
            other => Err(other.into_error(request.function().code())),
        }
    }

    fn into_error(self, function_code: u8) -> TransactionError {
        match self {
            Self::Io => TransactionError::io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "scripted connection reset",
            )),
            Self::SlaveException(code) => TransactionError::slave_exception(function_code, code),
            Self::IdMismatch => TransactionError::id_mismatch("scripted transaction id mismatch"),
            Self::Decode => TransactionError::decode("scripted malformed frame"),
            _ => unreachable!(),
        }
    }
}

// =============================================================================
// ScriptedFactory / ScriptedLink
// =============================================================================

/// Shared script state: connect outcomes and exchange outcomes, in order.
#[derive(Default)]
struct Script {
    /// Planned connect failures; `true` means the next connect fails.
    connect_failures: VecDeque<bool>,
    /// If set, every connect fails.
    always_fail_connect: bool,
    /// Planned exchange outcomes, shared across links so reconnects
    /// continue the same script.
    exchanges: VecDeque<PlannedExchange>,
    /// Fallback when the exchange script runs dry.
    default_exchange: Option<PlannedExchange>,
    /// Simulated duration of each exchange.
    exchange_delay: std::time::Duration,
}

/// Shared factory state, reachable from every link it hands out.
#[derive(Default)]
struct FactoryInner {
    script: Mutex<Script>,
    connects: AtomicUsize,
    exchange_times: Mutex<Vec<Instant>>,
}

impl FactoryInner {
    /// Records the exchange start and pops the next planned outcome plus
    /// the simulated exchange duration.
    fn begin_exchange(&self) -> (PlannedExchange, std::time::Duration) {
        self.exchange_times.lock().push(Instant::now());
        let mut script = self.script.lock();
        let outcome = script
            .exchanges
            .pop_front()
            .or_else(|| script.default_exchange.clone())
            .expect("exchange script ran dry and no default outcome is set");
        (outcome, script.exchange_delay)
    }
}

/// A [`LinkFactory`] that plays back a script.
#[derive(Default)]
pub struct ScriptedFactory {
    inner: Arc<FactoryInner>,
}

impl ScriptedFactory {
    /// Every connect succeeds; exchanges succeed with an empty register
    /// payload unless planned otherwise.
    pub fn always_ok() -> Self {
        let factory = Self::default();
        factory.inner.script.lock().default_exchange =
            Some(PlannedExchange::ReadRegisters(Vec::new()));
        factory
    }

    /// Every connect fails.
    pub fn failing_connects() -> Self {
        let factory = Self::default();
        factory.inner.script.lock().always_fail_connect = true;
        factory
    }

    /// Queues connect outcomes ahead of the always-succeed default:
    /// `true` fails the attempt.
    pub fn plan_connects(&self, failures: Vec<bool>) {
        self.inner.script.lock().connect_failures.extend(failures);
    }

    /// Queues exchange outcomes ahead of the default.
    pub fn plan_exchanges(&self, outcomes: Vec<PlannedExchange>) {
        self.inner.script.lock().exchanges.extend(outcomes);
    }

    /// Replaces the fallback outcome used when the script runs dry.
    pub fn set_default_exchange(&self, outcome: PlannedExchange) {
        self.inner.script.lock().default_exchange = Some(outcome);
    }

    /// Makes every exchange take this long (simulated wire time).
    pub fn set_exchange_delay(&self, delay: std::time::Duration) {
        self.inner.script.lock().exchange_delay = delay;
    }

    /// Number of connect attempts observed.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of exchanges observed.
    pub fn exchange_count(&self) -> usize {
        self.inner.exchange_times.lock().len()
    }

    /// Start instants of all observed exchanges.
    pub fn exchange_times(&self) -> Vec<Instant> {
        self.inner.exchange_times.lock().clone()
    }
}

#[async_trait]
impl LinkFactory for ScriptedFactory {
    async fn connect(
        &self,
        _endpoint: &EndpointKey,
        _config: &EndpointPoolConfig,
    ) -> io::Result<Box<dyn Link>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let fail = {
            let mut script = self.inner.script.lock();
            script.always_fail_connect || script.connect_failures.pop_front().unwrap_or(false)
        };
        if fail {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted connect failure",
            ));
        }
        Ok(Box::new(ScriptedLink {
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Link backed by the factory's shared script.
struct ScriptedLink {
    inner: Arc<FactoryInner>,
}

#[async_trait]
impl Link for ScriptedLink {
    async fn read(&mut self, request: &ReadRequest) -> Result<ReadPayload, TransactionError> {
        let (outcome, delay) = self.inner.begin_exchange();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome.into_read_result(request)
    }

    async fn write(&mut self, request: &WriteRequest) -> Result<WriteResponse, TransactionError> {
        let (outcome, delay) = self.inner.begin_exchange();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome.into_write_result(request)
    }

    async fn close(&mut self) {}
}

// =============================================================================
// Recording callbacks
// =============================================================================

/// Read callback that records every delivery.
#[derive(Default)]
pub struct RecordingReadCallback {
    reads: Mutex<Vec<ReadPayload>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingReadCallback {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful payloads, in delivery order.
    pub fn reads(&self) -> Vec<ReadPayload> {
        self.reads.lock().clone()
    }

    /// Error categories, in delivery order.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Total number of deliveries.
    pub fn delivery_count(&self) -> usize {
        self.reads.lock().len() + self.errors.lock().len()
    }
}

impl ReadCallback for RecordingReadCallback {
    fn on_read(&self, _request: &ReadRequest, payload: &ReadPayload) {
        self.reads.lock().push(payload.clone());
    }

    fn on_error(&self, _request: &ReadRequest, error: &TransactionError) {
        self.errors.lock().push(error.category().to_string());
    }
}

/// Write callback that records every delivery.
#[derive(Default)]
pub struct RecordingWriteCallback {
    writes: Mutex<Vec<WriteResponse>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingWriteCallback {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledged writes, in delivery order.
    pub fn writes(&self) -> Vec<WriteResponse> {
        self.writes.lock().clone()
    }

    /// Error categories, in delivery order.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl WriteCallback for RecordingWriteCallback {
    fn on_write(&self, _request: &WriteRequest, response: &WriteResponse) {
        self.writes.lock().push(*response);
    }

    fn on_error(&self, _request: &WriteRequest, error: &TransactionError) {
        self.errors.lock().push(error.category().to_string());
    }
}
