// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # busbar-json
//!
//! Optional adapter turning JSON write descriptions into
//! [`WriteRequest`] values for the transport manager.
//!
//! The accepted document is an array of write objects:
//!
//! ```json
//! [
//!     {"functionCode": 16, "address": 5412, "value": [1, 0, 5]},
//!     {"functionCode": 5, "address": 555, "value": [1]}
//! ]
//! ```
//!
//! - `functionCode`: 5 (single coil), 6 (single register), 15 (multiple
//!   coils) or 16 (multiple registers)
//! - `address`: reference address of the write
//! - `value`: data array; zero/non-zero for coils, one 16-bit word per
//!   register otherwise. Single-write function codes require exactly one
//!   element.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

use serde_json::Value as JsonValue;
use thiserror::Error;

use busbar_core::frame::{RequestError, WriteCoilRequest, WriteRegistersRequest, WriteRequest};

/// Key of the function code field.
pub const JSON_FUNCTION_CODE: &str = "functionCode";
/// Key of the write address field.
pub const JSON_ADDRESS: &str = "address";
/// Key of the value array field.
pub const JSON_VALUE: &str = "value";

/// Rejection of a JSON write document.
#[derive(Debug, Error)]
pub enum WriteJsonError {
    /// The document is not valid JSON.
    #[error("malformed json: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The top level is not an array, or an element is not an object.
    #[error("unexpected json structure: {0}")]
    Structure(String),

    /// A required field is missing or has the wrong type.
    #[error("field {field} missing or invalid in write object {index}")]
    Field {
        /// Field name.
        field: &'static str,
        /// Index of the offending write object.
        index: usize,
    },

    /// The function code is not a supported write function.
    #[error("unsupported write function code {0}")]
    UnsupportedFunction(i64),

    /// A single-write function code was given more or less than one value.
    #[error("function code {function_code} requires exactly one value, got {count}")]
    SingleValueExpected {
        /// Offending function code.
        function_code: i64,
        /// Number of values provided.
        count: usize,
    },

    /// The value array violates a request invariant (empty, too long, out
    /// of range).
    #[error("invalid write payload: {0}")]
    Payload(#[from] RequestError),

    /// A value element is not representable in the target width.
    #[error("value {value} at element {index} is not a valid {expected}")]
    Value {
        /// Display form of the offending element.
        value: String,
        /// Element index within the value array.
        index: usize,
        /// Expected element kind.
        expected: &'static str,
    },
}

/// Parses a JSON array of write objects into write requests for `unit_id`.
///
/// Requests come back in document order. An empty array yields an empty
/// vector.
///
/// # Errors
///
/// Any structural or payload problem rejects the whole document; no
/// partial request list is returned.
pub fn write_requests_from_json(
    unit_id: u8,
    json: &str,
    max_tries: u32,
) -> Result<Vec<WriteRequest>, WriteJsonError> {
    let document: JsonValue = serde_json::from_str(json)?;
    let array = document
        .as_array()
        .ok_or_else(|| WriteJsonError::Structure("top level must be an array".into()))?;

    let mut requests = Vec::with_capacity(array.len());
    for (index, element) in array.iter().enumerate() {
        requests.push(parse_write_object(unit_id, index, element, max_tries)?);
    }
    Ok(requests)
}

fn parse_write_object(
    unit_id: u8,
    index: usize,
    element: &JsonValue,
    max_tries: u32,
) -> Result<WriteRequest, WriteJsonError> {
    let object = element.as_object().ok_or_else(|| {
        WriteJsonError::Structure(format!("element {index} is not an object"))
    })?;

    let function_code = object
        .get(JSON_FUNCTION_CODE)
        .and_then(JsonValue::as_i64)
        .ok_or(WriteJsonError::Field {
            field: JSON_FUNCTION_CODE,
            index,
        })?;
    let address = object
        .get(JSON_ADDRESS)
        .and_then(JsonValue::as_u64)
        .and_then(|a| u16::try_from(a).ok())
        .ok_or(WriteJsonError::Field {
            field: JSON_ADDRESS,
            index,
        })?;
    let values = object
        .get(JSON_VALUE)
        .and_then(JsonValue::as_array)
        .ok_or(WriteJsonError::Field {
            field: JSON_VALUE,
            index,
        })?;

    let write_single = matches!(function_code, 5 | 6);
    if write_single && values.len() != 1 {
        return Err(WriteJsonError::SingleValueExpected {
            function_code,
            count: values.len(),
        });
    }

    match function_code {
        // Coil writes: zero is off, anything else on.
        5 | 15 => {
            let mut coils = Vec::with_capacity(values.len());
            for (element_index, value) in values.iter().enumerate() {
                let numeric = value.as_i64().ok_or_else(|| WriteJsonError::Value {
                    value: value.to_string(),
                    index: element_index,
                    expected: "coil state",
                })?;
                coils.push(numeric != 0);
            }
            let request = if write_single {
                WriteCoilRequest::single(unit_id, address, coils[0], max_tries)?
            } else {
                WriteCoilRequest::multiple(unit_id, address, coils, max_tries)?
            };
            Ok(WriteRequest::Coil(request))
        }
        // Register writes: each element is one 16-bit word.
        6 | 16 => {
            let mut data = Vec::with_capacity(values.len());
            for (element_index, value) in values.iter().enumerate() {
                let word = value
                    .as_i64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| WriteJsonError::Value {
                        value: value.to_string(),
                        index: element_index,
                        expected: "16-bit register value",
                    })?;
                data.push(word);
            }
            let request = if write_single {
                WriteRegistersRequest::single(unit_id, address, data[0], max_tries)?
            } else {
                WriteRegistersRequest::multiple(unit_id, address, data, max_tries)?
            };
            Ok(WriteRequest::Registers(request))
        }
        other => Err(WriteJsonError::UnsupportedFunction(other)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use busbar_core::frame::WriteFunction;

    #[test]
    fn empty_array_yields_no_requests() {
        assert!(write_requests_from_json(1, "[]", 3).unwrap().is_empty());
    }

    #[test]
    fn single_coil_write() {
        let requests = write_requests_from_json(
            1,
            r#"[{"functionCode": 5, "address": 555, "value": [1]}]"#,
            3,
        )
        .unwrap();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            WriteRequest::Coil(coil) => {
                assert_eq!(requests[0].function(), WriteFunction::SingleCoil);
                assert_eq!(requests[0].reference(), 555);
                assert_eq!(coil.coils(), &[true]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn multiple_register_write_preserves_order() {
        let requests = write_requests_from_json(
            2,
            r#"[{"functionCode": 16, "address": 5412, "value": [1, 0, 5]}]"#,
            3,
        )
        .unwrap();
        match &requests[0] {
            WriteRequest::Registers(registers) => {
                assert_eq!(requests[0].function(), WriteFunction::MultipleRegisters);
                assert_eq!(registers.data(), &[1, 0, 5]);
                assert_eq!(requests[0].unit_id(), 2);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn multiple_writes_come_back_in_document_order() {
        let requests = write_requests_from_json(
            1,
            r#"[
                {"functionCode": 6, "address": 4, "value": [18]},
                {"functionCode": 15, "address": 0, "value": [1, 0, 1]}
            ]"#,
            3,
        )
        .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].function(), WriteFunction::SingleRegister);
        assert_eq!(requests[1].function(), WriteFunction::MultipleCoils);
    }

    #[test]
    fn single_write_codes_demand_one_value() {
        let error = write_requests_from_json(
            1,
            r#"[{"functionCode": 5, "address": 1, "value": [1, 0]}]"#,
            3,
        )
        .unwrap_err();
        assert!(matches!(
            error,
            WriteJsonError::SingleValueExpected {
                function_code: 5,
                count: 2
            }
        ));
    }

    #[test]
    fn empty_value_array_is_rejected() {
        let error = write_requests_from_json(
            1,
            r#"[{"functionCode": 16, "address": 1, "value": []}]"#,
            3,
        )
        .unwrap_err();
        assert!(matches!(error, WriteJsonError::Payload(_)));
    }

    #[test]
    fn read_function_codes_are_rejected() {
        let error = write_requests_from_json(
            1,
            r#"[{"functionCode": 3, "address": 1, "value": [1]}]"#,
            3,
        )
        .unwrap_err();
        assert!(matches!(error, WriteJsonError::UnsupportedFunction(3)));
    }

    #[test]
    fn missing_fields_are_reported() {
        let error =
            write_requests_from_json(1, r#"[{"functionCode": 5, "value": [1]}]"#, 3).unwrap_err();
        assert!(matches!(
            error,
            WriteJsonError::Field {
                field: "address",
                ..
            }
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            write_requests_from_json(1, "not json", 3),
            Err(WriteJsonError::Malformed(_))
        ));
        assert!(matches!(
            write_requests_from_json(1, r#"{"functionCode": 5}"#, 3),
            Err(WriteJsonError::Structure(_))
        ));
    }
}
