// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types shared by the transport manager and its consumers.
//!
//! Two families live here:
//!
//! - [`TransactionError`]: everything that can go wrong while executing a
//!   single read/write transaction against a slave. Delivered to task
//!   callbacks; never thrown through the submission API.
//! - [`CodecError`]: failures of the pure register/value conversion layer.

use std::io;

use thiserror::Error;

use crate::value::ValueType;
use crate::endpoint::EndpointKey;

// =============================================================================
// TransactionError
// =============================================================================

/// Terminal error of a Modbus transaction, delivered via `on_error`.
///
/// Only the *last* error of a retry sequence reaches the callback; earlier
/// attempts are logged but not aggregated.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Connection to the endpoint could not be established within the
    /// configured connect-retry budget.
    #[error("could not connect to {endpoint}")]
    ConnectionFailed {
        /// The endpoint that could not be reached.
        endpoint: EndpointKey,
    },

    /// The link died mid-transaction (socket reset, serial failure, read
    /// timeout).
    #[error("i/o error during transaction: {source}")]
    Io {
        /// Underlying i/o error.
        #[source]
        source: io::Error,
    },

    /// The slave replied with an explicit exception PDU.
    #[error("slave exception response (function {function_code}, exception code {exception_code})")]
    SlaveException {
        /// Function code of the failed request.
        function_code: u8,
        /// Modbus exception code (e.g. 2 = illegal data address).
        exception_code: u8,
    },

    /// The response carried a transaction ID differing from the request's.
    #[error("response transaction id does not match request: {details}")]
    TransactionIdMismatch {
        /// Human-readable mismatch description from the wire layer.
        details: String,
    },

    /// The response frame could not be decoded.
    #[error("malformed response frame: {details}")]
    Decode {
        /// What was wrong with the frame.
        details: String,
    },

    /// Anything the other variants do not cover.
    #[error("unexpected transaction error: {details}")]
    Unknown {
        /// Description of the unexpected failure.
        details: String,
    },
}

impl TransactionError {
    /// Creates a connection-failed error for the given endpoint.
    pub fn connection_failed(endpoint: EndpointKey) -> Self {
        Self::ConnectionFailed { endpoint }
    }

    /// Creates an i/o error.
    pub fn io(source: io::Error) -> Self {
        Self::Io { source }
    }

    /// Creates a slave exception error.
    pub fn slave_exception(function_code: u8, exception_code: u8) -> Self {
        Self::SlaveException {
            function_code,
            exception_code,
        }
    }

    /// Creates a transaction-id mismatch error.
    pub fn id_mismatch(details: impl Into<String>) -> Self {
        Self::TransactionIdMismatch {
            details: details.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(details: impl Into<String>) -> Self {
        Self::Decode {
            details: details.into(),
        }
    }

    /// Creates an unknown error.
    pub fn unknown(details: impl Into<String>) -> Self {
        Self::Unknown {
            details: details.into(),
        }
    }

    /// Whether the executor must invalidate the pooled connection before
    /// retrying.
    ///
    /// A slave exception response proves the link itself is healthy, so the
    /// connection is kept; every other failure resets it.
    pub fn invalidates_connection(&self) -> bool {
        !matches!(self, Self::SlaveException { .. })
    }

    /// Short category label for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "connection",
            Self::Io { .. } => "io",
            Self::SlaveException { .. } => "slave-exception",
            Self::TransactionIdMismatch { .. } => "transaction-id",
            Self::Decode { .. } => "decode",
            Self::Unknown { .. } => "unknown",
        }
    }
}

// =============================================================================
// CodecError
// =============================================================================

/// Error of the register/value conversion layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// An extraction would read past the end of the register sequence.
    #[error("index {index} ({value_type:?}) out of bounds for {available} registers")]
    DecodeOutOfBounds {
        /// Requested index, in units of the value type.
        index: usize,
        /// Number of registers actually available.
        available: usize,
        /// The value type being extracted.
        value_type: ValueType,
    },

    /// A bit was requested past the logical size of a [`crate::frame::BitArray`].
    #[error("bit index {index} out of bounds for bit array of size {size}")]
    BitOutOfBounds {
        /// Requested bit index.
        index: usize,
        /// Logical number of bits in the array.
        size: usize,
    },

    /// A value cannot be represented in the requested value type.
    #[error("value {value} does not fit {value_type:?}")]
    ValueOutOfRange {
        /// Display form of the offending value.
        value: String,
        /// Target value type.
        value_type: ValueType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_exception_keeps_connection() {
        assert!(!TransactionError::slave_exception(3, 2).invalidates_connection());
        assert!(TransactionError::io(io::Error::new(io::ErrorKind::BrokenPipe, "x"))
            .invalidates_connection());
        assert!(TransactionError::id_mismatch("tid 5 != 4").invalidates_connection());
        assert!(TransactionError::decode("short frame").invalidates_connection());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(TransactionError::slave_exception(3, 2).category(), "slave-exception");
        assert_eq!(TransactionError::decode("x").category(), "decode");
    }
}
