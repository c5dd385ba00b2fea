// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! MBAP-over-UDP link.
//!
//! UDP slaves speak the Modbus TCP framing (MBAP header + PDU) over
//! datagrams, one exchange per datagram pair. The wire library only covers
//! stream transports, so this module carries its own compact ADU codec:
//!
//! ```text
//! MBAP: | tid (2) | protocol = 0 (2) | length (2) | unit (1) |
//! PDU:  | function (1) | data ... |
//! ```
//!
//! Transaction ids increment per request; a response with a different id is
//! reported as a transaction id mismatch so the executor resets the link.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use busbar_core::error::TransactionError;
use busbar_core::frame::{
    BitArray, ReadFunction, ReadPayload, ReadRequest, RegisterArray, WriteRequest, WriteResponse,
};

use crate::link::Link;

const MBAP_LEN: usize = 7;
const MAX_ADU: usize = 260;

// =============================================================================
// PDU codec
// =============================================================================

/// Builds the request PDU for a read.
pub(crate) fn build_read_pdu(request: &ReadRequest) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(request.function().code());
    pdu.extend_from_slice(&request.reference().to_be_bytes());
    pdu.extend_from_slice(&request.count().to_be_bytes());
    pdu
}

/// Builds the request PDU for a write.
pub(crate) fn build_write_pdu(request: &WriteRequest) -> Vec<u8> {
    let mut pdu = Vec::new();
    pdu.push(request.function().code());
    pdu.extend_from_slice(&request.reference().to_be_bytes());
    match request {
        WriteRequest::Coil(coil) if !coil.write_multiple() => {
            // FC 5: 0xFF00 switches the coil on, 0x0000 off.
            let value: u16 = if coil.coils()[0] { 0xff00 } else { 0x0000 };
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        WriteRequest::Coil(coil) => {
            let coils = coil.coils();
            let byte_count = coils.len().div_ceil(8);
            pdu.extend_from_slice(&(coils.len() as u16).to_be_bytes());
            pdu.push(byte_count as u8);
            let mut bytes = vec![0u8; byte_count];
            for (i, bit) in coils.iter().enumerate() {
                if *bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            pdu.extend_from_slice(&bytes);
        }
        WriteRequest::Registers(regs) if !regs.write_multiple() => {
            pdu.extend_from_slice(&regs.data()[0].to_be_bytes());
        }
        WriteRequest::Registers(regs) => {
            let data = regs.data();
            pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
            pdu.push((data.len() * 2) as u8);
            for register in data {
                pdu.extend_from_slice(&register.to_be_bytes());
            }
        }
    }
    pdu
}

/// Wraps a PDU in an MBAP header.
pub(crate) fn build_adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(MBAP_LEN + pdu.len());
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Splits a response ADU into `(transaction_id, unit_id, pdu)`.
pub(crate) fn parse_adu(frame: &[u8]) -> Result<(u16, u8, &[u8]), TransactionError> {
    if frame.len() < MBAP_LEN + 1 {
        return Err(TransactionError::decode(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }
    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol = u16::from_be_bytes([frame[2], frame[3]]);
    if protocol != 0 {
        return Err(TransactionError::decode(format!(
            "unexpected protocol identifier {protocol}"
        )));
    }
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if length < 2 || frame.len() < MBAP_LEN - 1 + length {
        return Err(TransactionError::decode(format!(
            "length field {length} does not match frame of {} bytes",
            frame.len()
        )));
    }
    let unit_id = frame[6];
    Ok((transaction_id, unit_id, &frame[MBAP_LEN..MBAP_LEN - 1 + length]))
}

/// Interprets a response PDU for the given request function code.
///
/// Returns the data portion after validating the echoed function code and
/// unwrapping exception responses.
fn check_response_pdu(function_code: u8, pdu: &[u8]) -> Result<&[u8], TransactionError> {
    let response_function = *pdu
        .first()
        .ok_or_else(|| TransactionError::decode("empty response pdu"))?;
    if response_function == function_code | 0x80 {
        let exception_code = pdu.get(1).copied().unwrap_or(0xff);
        return Err(TransactionError::slave_exception(function_code, exception_code));
    }
    if response_function != function_code {
        return Err(TransactionError::decode(format!(
            "response function {response_function} does not match request function {function_code}"
        )));
    }
    Ok(&pdu[1..])
}

/// Decodes a read response PDU into a payload.
pub(crate) fn parse_read_response(
    request: &ReadRequest,
    pdu: &[u8],
) -> Result<ReadPayload, TransactionError> {
    let data = check_response_pdu(request.function().code(), pdu)?;
    let byte_count = data
        .first()
        .copied()
        .ok_or_else(|| TransactionError::decode("missing byte count"))? as usize;
    let data = &data[1..];
    if data.len() < byte_count {
        return Err(TransactionError::decode(format!(
            "byte count {byte_count} exceeds {} payload bytes",
            data.len()
        )));
    }
    let count = request.count() as usize;
    match request.function() {
        ReadFunction::Coils | ReadFunction::DiscreteInputs => {
            if byte_count < count.div_ceil(8) {
                return Err(TransactionError::decode(format!(
                    "{byte_count} bytes cannot hold {count} bits"
                )));
            }
            let mut bits = Vec::with_capacity(byte_count * 8);
            for byte in &data[..byte_count] {
                for offset in 0..8 {
                    bits.push((byte >> offset) & 1 == 1);
                }
            }
            Ok(ReadPayload::Bits(BitArray::from_wire(bits, count)))
        }
        ReadFunction::HoldingRegisters | ReadFunction::InputRegisters => {
            if byte_count != count * 2 {
                return Err(TransactionError::decode(format!(
                    "expected {} data bytes for {count} registers, got {byte_count}",
                    count * 2
                )));
            }
            let registers = data[..byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(ReadPayload::Registers(RegisterArray::new(registers)))
        }
    }
}

/// Validates a write response PDU.
pub(crate) fn parse_write_response(
    request: &WriteRequest,
    pdu: &[u8],
) -> Result<WriteResponse, TransactionError> {
    let function_code = request.function().code();
    check_response_pdu(function_code, pdu)?;
    Ok(WriteResponse { function_code })
}

// =============================================================================
// UdpLink
// =============================================================================

/// One connected UDP socket speaking MBAP-framed Modbus.
pub(crate) struct UdpLink {
    socket: UdpSocket,
    transaction_id: u16,
    operation_timeout: Duration,
}

impl UdpLink {
    /// Binds an ephemeral local port and connects it to the slave.
    pub(crate) async fn connect(host: &str, port: u16, operation_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        Ok(Self {
            socket,
            transaction_id: 0,
            operation_timeout,
        })
    }

    async fn exchange(&mut self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>, TransactionError> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;
        let adu = build_adu(transaction_id, unit_id, pdu);
        trace!(tid = transaction_id, frame = %hex(&adu), "udp request");

        self.socket
            .send(&adu)
            .await
            .map_err(TransactionError::io)?;

        let mut buffer = [0u8; MAX_ADU];
        let received = timeout(self.operation_timeout, self.socket.recv(&mut buffer))
            .await
            .map_err(|_| {
                TransactionError::io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no datagram within {:?}", self.operation_timeout),
                ))
            })?
            .map_err(TransactionError::io)?;
        let frame = &buffer[..received];
        trace!(frame = %hex(frame), "udp response");

        let (response_id, _unit, response_pdu) = parse_adu(frame)?;
        if response_id != transaction_id {
            return Err(TransactionError::id_mismatch(format!(
                "request {transaction_id}, response {response_id}"
            )));
        }
        Ok(response_pdu.to_vec())
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn read(&mut self, request: &ReadRequest) -> Result<ReadPayload, TransactionError> {
        let pdu = build_read_pdu(request);
        let response = self.exchange(request.unit_id(), &pdu).await?;
        parse_read_response(request, &response)
    }

    async fn write(&mut self, request: &WriteRequest) -> Result<WriteResponse, TransactionError> {
        let pdu = build_write_pdu(request);
        let response = self.exchange(request.unit_id(), &pdu).await?;
        parse_write_response(request, &response)
    }

    async fn close(&mut self) {
        // Dropping the socket releases the port; nothing to flush.
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use busbar_core::frame::{WriteCoilRequest, WriteRegistersRequest};

    fn read_request(function: ReadFunction, reference: u16, count: u16) -> ReadRequest {
        ReadRequest::new(1, function, reference, count, 1).unwrap()
    }

    #[test]
    fn single_coil_write_uses_ff00() {
        let on = WriteRequest::Coil(WriteCoilRequest::single(1, 10, true, 1).unwrap());
        assert_eq!(build_write_pdu(&on), vec![0x05, 0x00, 0x0a, 0xff, 0x00]);

        let off = WriteRequest::Coil(WriteCoilRequest::single(1, 10, false, 1).unwrap());
        assert_eq!(build_write_pdu(&off), vec![0x05, 0x00, 0x0a, 0x00, 0x00]);
    }

    #[test]
    fn multi_register_write_packs_big_endian() {
        let request = WriteRequest::Registers(
            WriteRegistersRequest::multiple(1, 0x0100, vec![0x1234, 0x5678], 1).unwrap(),
        );
        assert_eq!(
            build_write_pdu(&request),
            vec![0x10, 0x01, 0x00, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn multi_coil_write_packs_lsb_first() {
        let request = WriteRequest::Coil(
            WriteCoilRequest::multiple(1, 0, vec![true, false, true, true], 1).unwrap(),
        );
        // 0b1101 = 0x0d
        assert_eq!(
            build_write_pdu(&request),
            vec![0x0f, 0x00, 0x00, 0x00, 0x04, 0x01, 0x0d]
        );
    }

    #[test]
    fn read_pdu_layout() {
        let request = read_request(ReadFunction::HoldingRegisters, 100, 2);
        assert_eq!(build_read_pdu(&request), vec![0x03, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn adu_round_trip() {
        let adu = build_adu(0x1234, 0x11, &[0x03, 0x00, 0x64, 0x00, 0x02]);
        assert_eq!(&adu[..7], &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11]);
        let (tid, unit, pdu) = parse_adu(&adu).unwrap();
        assert_eq!(tid, 0x1234);
        assert_eq!(unit, 0x11);
        assert_eq!(pdu, &[0x03, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn register_response_decodes() {
        let request = read_request(ReadFunction::HoldingRegisters, 100, 2);
        let payload =
            parse_read_response(&request, &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        match payload {
            ReadPayload::Registers(regs) => {
                assert_eq!(regs.as_slice(), &[0x1234, 0x5678]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn coil_response_truncates_padding() {
        let request = read_request(ReadFunction::Coils, 0, 3);
        let payload = parse_read_response(&request, &[0x01, 0x01, 0b0000_0101]).unwrap();
        match payload {
            ReadPayload::Bits(bits) => {
                assert_eq!(bits.len(), 3);
                assert!(bits.get(0).unwrap());
                assert!(!bits.get(1).unwrap());
                assert!(bits.get(2).unwrap());
                assert!(bits.get(3).is_err());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn exception_response_maps_to_slave_exception() {
        let request = read_request(ReadFunction::HoldingRegisters, 100, 2);
        let error = parse_read_response(&request, &[0x83, 0x02]).unwrap_err();
        match error {
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

    #[test]
    fn short_frame_is_decode_error() {
        assert!(matches!(
            parse_adu(&[0x00, 0x01, 0x00]),
            Err(TransactionError::Decode { .. })
        ));
    }
}
