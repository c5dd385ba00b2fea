// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Immutable request and response value objects.
//!
//! Requests describe a single read or write exchange: unit ID, function
//! code, reference address, quantity or payload, and a retry budget.
//! Equality is by content so that the scheduler can deduplicate poll
//! registrations keyed by request identity.
//!
//! Responses carry either a [`RegisterArray`] (holding/input registers) or a
//! [`BitArray`] (coils/discretes) whose size reflects the number of logical
//! elements requested, never the byte-padded count returned at the wire.

use std::fmt;

use crate::error::CodecError;

// =============================================================================
// Function codes
// =============================================================================

/// Modbus read function codes supported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadFunction {
    /// FC 1: read coils.
    Coils,
    /// FC 2: read discrete inputs.
    DiscreteInputs,
    /// FC 3: read holding registers.
    HoldingRegisters,
    /// FC 4: read input registers.
    InputRegisters,
}

impl ReadFunction {
    /// Wire function code.
    pub fn code(self) -> u8 {
        match self {
            Self::Coils => 1,
            Self::DiscreteInputs => 2,
            Self::HoldingRegisters => 3,
            Self::InputRegisters => 4,
        }
    }

    /// Looks up a read function by wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Coils),
            2 => Some(Self::DiscreteInputs),
            3 => Some(Self::HoldingRegisters),
            4 => Some(Self::InputRegisters),
            _ => None,
        }
    }

    /// Maximum quantity a single request may carry, per the Modbus
    /// specification (2000 bits, 125 registers).
    pub fn max_quantity(self) -> u16 {
        match self {
            Self::Coils | Self::DiscreteInputs => 2000,
            Self::HoldingRegisters | Self::InputRegisters => 125,
        }
    }

    /// Whether this function reads single-bit datapoints.
    pub fn reads_bits(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }
}

/// Modbus write function codes supported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteFunction {
    /// FC 5: write single coil.
    SingleCoil,
    /// FC 6: write single register.
    SingleRegister,
    /// FC 15: write multiple coils.
    MultipleCoils,
    /// FC 16: write multiple registers.
    MultipleRegisters,
}

impl WriteFunction {
    /// Wire function code.
    pub fn code(self) -> u8 {
        match self {
            Self::SingleCoil => 5,
            Self::SingleRegister => 6,
            Self::MultipleCoils => 15,
            Self::MultipleRegisters => 16,
        }
    }

    /// Looks up a write function by wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            5 => Some(Self::SingleCoil),
            6 => Some(Self::SingleRegister),
            15 => Some(Self::MultipleCoils),
            16 => Some(Self::MultipleRegisters),
            _ => None,
        }
    }
}

// =============================================================================
// Request validation errors
// =============================================================================

/// Rejection of a malformed request at construction time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Quantity outside `[1, max]` for the function code.
    #[error("quantity {quantity} outside [1, {max}] for function code {function_code}")]
    InvalidQuantity {
        /// Requested element count.
        quantity: usize,
        /// Maximum allowed for the function.
        max: u16,
        /// Offending function code.
        function_code: u8,
    },

    /// A retry budget of zero is meaningless.
    #[error("max_tries must be at least 1")]
    ZeroTries,
}

// =============================================================================
// ReadRequest
// =============================================================================

/// An immutable blueprint of a single read exchange.
///
/// Two requests compare equal when all five fields match; registered polls
/// are deduplicated on this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadRequest {
    unit_id: u8,
    function: ReadFunction,
    reference: u16,
    count: u16,
    max_tries: u32,
}

impl ReadRequest {
    /// Creates a read request, validating quantity and retry budget.
    pub fn new(
        unit_id: u8,
        function: ReadFunction,
        reference: u16,
        count: u16,
        max_tries: u32,
    ) -> Result<Self, RequestError> {
        if count == 0 || count > function.max_quantity() {
            return Err(RequestError::InvalidQuantity {
                quantity: count as usize,
                max: function.max_quantity(),
                function_code: function.code(),
            });
        }
        if max_tries == 0 {
            return Err(RequestError::ZeroTries);
        }
        Ok(Self {
            unit_id,
            function,
            reference,
            count,
            max_tries,
        })
    }

    /// Unit (slave) ID addressed by this request.
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Read function.
    pub fn function(&self) -> ReadFunction {
        self.function
    }

    /// Reference (start) address.
    pub fn reference(&self) -> u16 {
        self.reference
    }

    /// Number of elements (bits or registers) to read.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Total attempts allowed, including the first.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }
}

impl fmt::Display for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read[unit={} fc={} ref={} count={}]",
            self.unit_id,
            self.function.code(),
            self.reference,
            self.count
        )
    }
}

// =============================================================================
// WriteRequest
// =============================================================================

/// An immutable blueprint of a single write exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteRequest {
    /// Coil write (FC 5 or 15).
    Coil(WriteCoilRequest),
    /// Register write (FC 6 or 16).
    Registers(WriteRegistersRequest),
}

impl WriteRequest {
    /// Unit (slave) ID addressed by this request.
    pub fn unit_id(&self) -> u8 {
        match self {
            Self::Coil(r) => r.unit_id,
            Self::Registers(r) => r.unit_id,
        }
    }

    /// Reference (start) address.
    pub fn reference(&self) -> u16 {
        match self {
            Self::Coil(r) => r.reference,
            Self::Registers(r) => r.reference,
        }
    }

    /// The wire function this request emits.
    pub fn function(&self) -> WriteFunction {
        match self {
            Self::Coil(r) => {
                if r.write_multiple {
                    WriteFunction::MultipleCoils
                } else {
                    WriteFunction::SingleCoil
                }
            }
            Self::Registers(r) => {
                if r.write_multiple {
                    WriteFunction::MultipleRegisters
                } else {
                    WriteFunction::SingleRegister
                }
            }
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_tries(&self) -> u32 {
        match self {
            Self::Coil(r) => r.max_tries,
            Self::Registers(r) => r.max_tries,
        }
    }
}

impl fmt::Display for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = match self {
            Self::Coil(r) => r.coils.len(),
            Self::Registers(r) => r.data.len(),
        };
        write!(
            f,
            "write[unit={} fc={} ref={} len={}]",
            self.unit_id(),
            self.function().code(),
            self.reference(),
            len
        )
    }
}

/// Coil write payload: one bit for FC 5, a bit run for FC 15.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteCoilRequest {
    unit_id: u8,
    reference: u16,
    coils: Vec<bool>,
    write_multiple: bool,
    max_tries: u32,
}

impl WriteCoilRequest {
    /// Single-coil write emitting FC 5.
    pub fn single(unit_id: u8, reference: u16, bit: bool, max_tries: u32) -> Result<Self, RequestError> {
        Self::build(unit_id, reference, vec![bit], false, max_tries)
    }

    /// Multi-coil write emitting FC 15.
    pub fn multiple(
        unit_id: u8,
        reference: u16,
        coils: Vec<bool>,
        max_tries: u32,
    ) -> Result<Self, RequestError> {
        Self::build(unit_id, reference, coils, true, max_tries)
    }

    fn build(
        unit_id: u8,
        reference: u16,
        coils: Vec<bool>,
        write_multiple: bool,
        max_tries: u32,
    ) -> Result<Self, RequestError> {
        // FC 15 carries at most 1968 coils; FC 5 exactly one.
        let max = if write_multiple { 1968 } else { 1 };
        if coils.is_empty() || coils.len() > max as usize {
            return Err(RequestError::InvalidQuantity {
                quantity: coils.len(),
                max,
                function_code: if write_multiple { 15 } else { 5 },
            });
        }
        if max_tries == 0 {
            return Err(RequestError::ZeroTries);
        }
        Ok(Self {
            unit_id,
            reference,
            coils,
            write_multiple,
            max_tries,
        })
    }

    /// Coil states to write, in address order.
    pub fn coils(&self) -> &[bool] {
        &self.coils
    }

    /// Whether this request emits FC 15 rather than FC 5.
    pub fn write_multiple(&self) -> bool {
        self.write_multiple
    }
}

/// Register write payload: one register for FC 6, a run for FC 16.
///
/// Register data is packed big-endian within each 16-bit register at the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteRegistersRequest {
    unit_id: u8,
    reference: u16,
    data: Vec<u16>,
    write_multiple: bool,
    max_tries: u32,
}

impl WriteRegistersRequest {
    /// Single-register write emitting FC 6.
    pub fn single(unit_id: u8, reference: u16, value: u16, max_tries: u32) -> Result<Self, RequestError> {
        Self::build(unit_id, reference, vec![value], false, max_tries)
    }

    /// Multi-register write emitting FC 16.
    pub fn multiple(
        unit_id: u8,
        reference: u16,
        data: Vec<u16>,
        max_tries: u32,
    ) -> Result<Self, RequestError> {
        Self::build(unit_id, reference, data, true, max_tries)
    }

    fn build(
        unit_id: u8,
        reference: u16,
        data: Vec<u16>,
        write_multiple: bool,
        max_tries: u32,
    ) -> Result<Self, RequestError> {
        // FC 16 carries at most 123 registers; FC 6 exactly one.
        let max = if write_multiple { 123 } else { 1 };
        if data.is_empty() || data.len() > max as usize {
            return Err(RequestError::InvalidQuantity {
                quantity: data.len(),
                max,
                function_code: if write_multiple { 16 } else { 6 },
            });
        }
        if max_tries == 0 {
            return Err(RequestError::ZeroTries);
        }
        Ok(Self {
            unit_id,
            reference,
            data,
            write_multiple,
            max_tries,
        })
    }

    /// Register values to write, in address order.
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    /// Whether this request emits FC 16 rather than FC 6.
    pub fn write_multiple(&self) -> bool {
        self.write_multiple
    }
}

// =============================================================================
// Response payloads
// =============================================================================

/// Registers returned by a holding/input read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterArray {
    registers: Vec<u16>,
}

impl RegisterArray {
    /// Wraps raw register data.
    pub fn new(registers: Vec<u16>) -> Self {
        Self { registers }
    }

    /// Number of registers.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Register at `index`, if in bounds.
    pub fn get(&self, index: usize) -> Option<u16> {
        self.registers.get(index).copied()
    }

    /// Raw register slice.
    pub fn as_slice(&self) -> &[u16] {
        &self.registers
    }

    /// Space-separated hex rendering for trace logging.
    pub fn to_hex(&self) -> String {
        self.registers
            .iter()
            .map(|r| format!("{r:04x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<Vec<u16>> for RegisterArray {
    fn from(registers: Vec<u16>) -> Self {
        Self::new(registers)
    }
}

impl fmt::Display for RegisterArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registers[{}]", self.to_hex())
    }
}

/// Bits returned by a coil/discrete read.
///
/// The wire pads coil responses to whole bytes; the logical size recorded
/// here is the count that was requested, and reads past it fail rather than
/// exposing padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray {
    bits: Vec<bool>,
}

impl BitArray {
    /// Wraps decoded bits, truncating any byte padding beyond `count`.
    pub fn from_wire(mut bits: Vec<bool>, count: usize) -> Self {
        bits.truncate(count);
        Self { bits }
    }

    /// Logical number of bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Bit at `index`.
    ///
    /// # Errors
    ///
    /// [`CodecError::BitOutOfBounds`] when `index >= len()`.
    pub fn get(&self, index: usize) -> Result<bool, CodecError> {
        self.bits
            .get(index)
            .copied()
            .ok_or(CodecError::BitOutOfBounds {
                index,
                size: self.bits.len(),
            })
    }

    /// Raw bit slice.
    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bits[")?;
        for bit in &self.bits {
            write!(f, "{}", u8::from(*bit))?;
        }
        write!(f, "]")
    }
}

/// Decoded payload of a successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPayload {
    /// Holding/input register data.
    Registers(RegisterArray),
    /// Coil/discrete bit data.
    Bits(BitArray),
}

impl ReadPayload {
    /// Number of logical elements in the payload.
    pub fn len(&self) -> usize {
        match self {
            Self::Registers(r) => r.len(),
            Self::Bits(b) => b.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acknowledgement of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    /// Function code the slave acknowledged.
    pub function_code: u8,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_equality_is_by_content() {
        let a = ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, 3).unwrap();
        let b = ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, 3).unwrap();
        let c = ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn read_request_rejects_bad_quantities() {
        assert!(ReadRequest::new(1, ReadFunction::HoldingRegisters, 0, 0, 3).is_err());
        assert!(ReadRequest::new(1, ReadFunction::HoldingRegisters, 0, 126, 3).is_err());
        assert!(ReadRequest::new(1, ReadFunction::Coils, 0, 2000, 3).is_ok());
        assert!(ReadRequest::new(1, ReadFunction::Coils, 0, 2001, 3).is_err());
        assert!(ReadRequest::new(1, ReadFunction::Coils, 0, 1, 0).is_err());
    }

    #[test]
    fn write_function_selection() {
        let single = WriteRequest::Coil(WriteCoilRequest::single(1, 10, true, 1).unwrap());
        assert_eq!(single.function(), WriteFunction::SingleCoil);
        assert_eq!(single.function().code(), 5);

        let multi =
            WriteRequest::Coil(WriteCoilRequest::multiple(1, 10, vec![true, false], 1).unwrap());
        assert_eq!(multi.function().code(), 15);

        let reg = WriteRequest::Registers(WriteRegistersRequest::single(1, 4, 0x1234, 1).unwrap());
        assert_eq!(reg.function().code(), 6);

        let regs = WriteRequest::Registers(
            WriteRegistersRequest::multiple(1, 4, vec![1, 2, 3], 1).unwrap(),
        );
        assert_eq!(regs.function().code(), 16);
    }

    #[test]
    fn write_request_enforces_payload_invariants() {
        assert!(WriteRegistersRequest::multiple(1, 0, vec![], 1).is_err());
        assert!(WriteRegistersRequest::multiple(1, 0, vec![0; 123], 1).is_ok());
        assert!(WriteRegistersRequest::multiple(1, 0, vec![0; 124], 1).is_err());
        assert!(WriteCoilRequest::multiple(1, 0, vec![true; 1969], 1).is_err());
    }

    #[test]
    fn bit_array_honours_logical_size() {
        // Wire returned a whole byte for a 3-bit read.
        let bits = BitArray::from_wire(vec![true, false, true, false, false, false, false, false], 3);
        assert_eq!(bits.len(), 3);
        assert!(bits.get(0).unwrap());
        assert!(bits.get(2).unwrap());
        assert!(matches!(
            bits.get(3),
            Err(CodecError::BitOutOfBounds { index: 3, size: 3 })
        ));
    }

    #[test]
    fn register_array_hex_rendering() {
        let regs = RegisterArray::new(vec![0x1234, 0x0001]);
        assert_eq!(regs.to_hex(), "1234 0001");
        assert_eq!(regs.get(1), Some(0x0001));
        assert_eq!(regs.get(2), None);
    }
}
