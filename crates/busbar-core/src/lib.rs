// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # busbar-core
//!
//! Core value types and data-extraction primitives for the busbar Modbus
//! transport manager.
//!
//! This crate is deliberately free of i/o: it defines the vocabulary shared
//! between the manager (`busbar-manager`) and its consumers.
//!
//! - **Value codec** ([`value`]): registers ↔ typed scalars, with
//!   configurable word order for multi-register values
//! - **Request/response model** ([`frame`]): immutable read/write
//!   blueprints, register and bit payloads
//! - **Endpoint identity** ([`endpoint`]): canonical keys for physical
//!   links and per-endpoint pool tuning
//! - **Task model** ([`task`]): requests bound to endpoints and weakly-held
//!   consumer callbacks
//! - **Errors** ([`error`]): the transaction error taxonomy delivered to
//!   callbacks

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod endpoint;
pub mod error;
pub mod frame;
pub mod task;
pub mod value;

pub use endpoint::{
    DataBits, EndpointKey, EndpointPoolConfig, Parity, SerialEncoding, StopBits,
    DEFAULT_SERIAL_INTER_TRANSACTION_DELAY, DEFAULT_TCP_INTER_TRANSACTION_DELAY,
};
pub use error::{CodecError, TransactionError};
pub use frame::{
    BitArray, ReadFunction, ReadPayload, ReadRequest, RegisterArray, RequestError, WriteCoilRequest,
    WriteFunction, WriteRegistersRequest, WriteRequest, WriteResponse,
};
pub use task::{ReadCallback, ReadTask, WriteCallback, WriteTask};
pub use value::{extract_from_registers, parse_bool, value_to_registers, Value, ValueType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
