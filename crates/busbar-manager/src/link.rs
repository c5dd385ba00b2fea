// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The wire link seam between the pool and the Modbus codec libraries.
//!
//! A [`Link`] is one live connection to an endpoint, able to run a single
//! request/response exchange at a time. The pool creates links through a
//! [`LinkFactory`]; the production [`WireLinkFactory`] drives `tokio-modbus`
//! for TCP and serial-RTU endpoints and a small MBAP-over-UDP adapter for
//! UDP ones. Tests (and exotic deployments) inject their own factory.
//!
//! Every wire failure is classified here into the
//! [`TransactionError`] taxonomy the executor's retry table is written
//! against: i/o errors and timeouts, explicit slave exceptions, transaction
//! id mismatches, and frame decode failures.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_modbus::client::{Context as ModbusContext, Reader, Writer};
use tokio_modbus::prelude::*;
use tokio_modbus::{Error as WireError, Exception};
use tokio_serial::SerialPortBuilderExt;
use tracing::trace;

use busbar_core::endpoint::{DataBits, EndpointKey, EndpointPoolConfig, Parity, SerialEncoding, StopBits};
use busbar_core::error::TransactionError;
use busbar_core::frame::{
    BitArray, ReadFunction, ReadPayload, ReadRequest, RegisterArray, WriteRequest, WriteResponse,
};

use crate::udp::UdpLink;

// =============================================================================
// Link / LinkFactory traits
// =============================================================================

/// A live connection to a Modbus endpoint.
///
/// Implementations need not be thread-safe; the pool guarantees at most one
/// in-flight exchange per link.
#[async_trait]
pub trait Link: Send {
    /// Runs one read exchange.
    async fn read(&mut self, request: &ReadRequest) -> Result<ReadPayload, TransactionError>;

    /// Runs one write exchange.
    async fn write(&mut self, request: &WriteRequest) -> Result<WriteResponse, TransactionError>;

    /// Gracefully closes the connection. Dropping the link closes it hard.
    async fn close(&mut self);
}

/// Creates links on behalf of the pool.
///
/// The pool bounds each `connect` call with the endpoint's configured
/// connect timeout and retries it up to the configured budget.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Opens a new connection to `endpoint`.
    async fn connect(
        &self,
        endpoint: &EndpointKey,
        config: &EndpointPoolConfig,
    ) -> io::Result<Box<dyn Link>>;
}

// =============================================================================
// WireLinkFactory
// =============================================================================

/// Production factory: `tokio-modbus` over TCP and serial, MBAP over UDP.
#[derive(Debug, Default)]
pub struct WireLinkFactory;

impl WireLinkFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LinkFactory for WireLinkFactory {
    async fn connect(
        &self,
        endpoint: &EndpointKey,
        config: &EndpointPoolConfig,
    ) -> io::Result<Box<dyn Link>> {
        match endpoint {
            EndpointKey::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true).ok();
                // Unit id is set per request; attach with the broadcast id
                // as a placeholder.
                let ctx = tcp::attach_slave(stream, Slave(0));
                trace!(endpoint = %endpoint, "opened tcp link");
                Ok(Box::new(ModbusLink {
                    ctx,
                    operation_timeout: config.operation_timeout,
                }))
            }
            EndpointKey::Udp { host, port } => {
                let link = UdpLink::connect(host, *port, config.operation_timeout).await?;
                trace!(endpoint = %endpoint, "opened udp link");
                Ok(Box::new(link))
            }
            EndpointKey::Serial {
                device,
                baud,
                data_bits,
                parity,
                stop_bits,
                encoding,
            } => {
                if *encoding == SerialEncoding::Ascii {
                    // The wire library only provides RTU framing.
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("ASCII framing is not supported for {device}"),
                    ));
                }
                let builder = tokio_serial::new(device, *baud)
                    .data_bits(map_data_bits(*data_bits))
                    .parity(map_parity(*parity))
                    .stop_bits(map_stop_bits(*stop_bits));
                let port = builder
                    .open_native_async()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                let ctx = rtu::attach_slave(port, Slave(0));
                trace!(endpoint = %endpoint, "opened serial rtu link");
                Ok(Box::new(ModbusLink {
                    ctx,
                    operation_timeout: config.operation_timeout,
                }))
            }
        }
    }
}

fn map_data_bits(bits: DataBits) -> tokio_serial::DataBits {
    match bits {
        DataBits::Five => tokio_serial::DataBits::Five,
        DataBits::Six => tokio_serial::DataBits::Six,
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    }
}

fn map_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn map_stop_bits(bits: StopBits) -> tokio_serial::StopBits {
    match bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

// =============================================================================
// ModbusLink
// =============================================================================

/// Link over a `tokio-modbus` context (TCP or serial RTU).
struct ModbusLink {
    ctx: ModbusContext,
    operation_timeout: Duration,
}

impl ModbusLink {
    fn timeout_error(&self) -> TransactionError {
        TransactionError::io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response within {:?}", self.operation_timeout),
        ))
    }
}

#[async_trait]
impl Link for ModbusLink {
    async fn read(&mut self, request: &ReadRequest) -> Result<ReadPayload, TransactionError> {
        self.ctx.set_slave(Slave(request.unit_id()));
        let reference = request.reference();
        let count = request.count();

        let payload = match request.function() {
            ReadFunction::Coils => {
                let bits = timeout(self.operation_timeout, self.ctx.read_coils(reference, count))
                    .await
                    .map_err(|_| self.timeout_error())?
                    .map_err(map_wire_error)?
                    .map_err(|code| map_exception(request.function().code(), code))?;
                ReadPayload::Bits(BitArray::from_wire(bits, count as usize))
            }
            ReadFunction::DiscreteInputs => {
                let bits = timeout(
                    self.operation_timeout,
                    self.ctx.read_discrete_inputs(reference, count),
                )
                .await
                .map_err(|_| self.timeout_error())?
                .map_err(map_wire_error)?
                .map_err(|code| map_exception(request.function().code(), code))?;
                ReadPayload::Bits(BitArray::from_wire(bits, count as usize))
            }
            ReadFunction::HoldingRegisters => {
                let regs = timeout(
                    self.operation_timeout,
                    self.ctx.read_holding_registers(reference, count),
                )
                .await
                .map_err(|_| self.timeout_error())?
                .map_err(map_wire_error)?
                .map_err(|code| map_exception(request.function().code(), code))?;
                ReadPayload::Registers(RegisterArray::new(regs))
            }
            ReadFunction::InputRegisters => {
                let regs = timeout(
                    self.operation_timeout,
                    self.ctx.read_input_registers(reference, count),
                )
                .await
                .map_err(|_| self.timeout_error())?
                .map_err(map_wire_error)?
                .map_err(|code| map_exception(request.function().code(), code))?;
                ReadPayload::Registers(RegisterArray::new(regs))
            }
        };

        if let ReadPayload::Registers(regs) = &payload {
            trace!(request = %request, response = %regs.to_hex(), "read exchange complete");
        } else {
            trace!(request = %request, "read exchange complete");
        }
        Ok(payload)
    }

    async fn write(&mut self, request: &WriteRequest) -> Result<WriteResponse, TransactionError> {
        self.ctx.set_slave(Slave(request.unit_id()));
        let reference = request.reference();
        let function_code = request.function().code();

        let exchange = match request {
            WriteRequest::Coil(coil) => {
                if coil.write_multiple() {
                    timeout(
                        self.operation_timeout,
                        self.ctx.write_multiple_coils(reference, coil.coils()),
                    )
                    .await
                } else {
                    timeout(
                        self.operation_timeout,
                        self.ctx.write_single_coil(reference, coil.coils()[0]),
                    )
                    .await
                }
            }
            WriteRequest::Registers(regs) => {
                if regs.write_multiple() {
                    timeout(
                        self.operation_timeout,
                        self.ctx.write_multiple_registers(reference, regs.data()),
                    )
                    .await
                } else {
                    timeout(
                        self.operation_timeout,
                        self.ctx.write_single_register(reference, regs.data()[0]),
                    )
                    .await
                }
            }
        };

        exchange
            .map_err(|_| self.timeout_error())?
            .map_err(map_wire_error)?
            .map_err(|code| map_exception(function_code, code))?;

        trace!(request = %request, "write exchange complete");
        Ok(WriteResponse { function_code })
    }

    async fn close(&mut self) {
        if let Err(error) = self.ctx.disconnect().await {
            trace!(%error, "error closing modbus link");
        }
    }
}

// =============================================================================
// Error classification
// =============================================================================

/// Classifies a `tokio-modbus` error into the transaction error taxonomy.
pub(crate) fn map_wire_error(error: WireError) -> TransactionError {
    match error {
        WireError::Transport(io_error) => {
            if io_error.kind() == io::ErrorKind::InvalidData {
                // The codec reports both header mismatches and malformed
                // frames as InvalidData; the message disambiguates.
                let text = io_error.to_string();
                if text.contains("response header") || text.contains("transaction") {
                    TransactionError::id_mismatch(text)
                } else {
                    TransactionError::decode(text)
                }
            } else {
                TransactionError::io(io_error)
            }
        }
        WireError::Protocol(protocol_error) => {
            let text = format!("{protocol_error:?}");
            if text.contains("Header") || text.contains("Mismatch") {
                TransactionError::id_mismatch(text)
            } else {
                TransactionError::decode(text)
            }
        }
    }
}

/// Converts a slave exception response into the error taxonomy.
pub(crate) fn map_exception(function_code: u8, code: Exception) -> TransactionError {
    TransactionError::slave_exception(function_code, exception_code_to_u8(code))
}

fn exception_code_to_u8(code: Exception) -> u8 {
    match code {
        Exception::IllegalFunction => 0x01,
        Exception::IllegalDataAddress => 0x02,
        Exception::IllegalDataValue => 0x03,
        Exception::ServerDeviceFailure => 0x04,
        Exception::Acknowledge => 0x05,
        Exception::ServerDeviceBusy => 0x06,
        Exception::MemoryParityError => 0x08,
        Exception::GatewayPathUnavailable => 0x0a,
        Exception::GatewayTargetDevice => 0x0b,
        _ => 0xff,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_data_with_header_text_is_id_mismatch() {
        let error = WireError::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            "Invalid response header: expected/request = 4, actual/response = 5",
        ));
        assert!(matches!(
            map_wire_error(error),
            TransactionError::TransactionIdMismatch { .. }
        ));
    }

    #[test]
    fn invalid_data_without_header_text_is_decode() {
        let error = WireError::Transport(io::Error::new(io::ErrorKind::InvalidData, "short frame"));
        assert!(matches!(map_wire_error(error), TransactionError::Decode { .. }));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let error = WireError::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(map_wire_error(error), TransactionError::Io { .. }));
    }

    #[test]
    fn exception_codes_map_to_wire_values() {
        match map_exception(3, Exception::IllegalDataAddress) {
            TransactionError::SlaveException {
                function_code,
                exception_code,
            } => {
                assert_eq!(function_code, 3);
                assert_eq!(exception_code, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
