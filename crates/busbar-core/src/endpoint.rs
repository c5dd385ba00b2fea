// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint identity and per-endpoint pool tuning.
//!
//! An [`EndpointKey`] canonically names one physical Modbus link. Equality
//! is structural and the hash is stable, so two tasks targeting keys that
//! compare equal serialise through the same connection slot regardless of
//! where the keys were constructed.
//!
//! [`EndpointPoolConfig`] carries the pacing and reconnect policy the pool
//! applies to that link. Defaults differ per transport: TCP and UDP slaves
//! get a 60 ms inter-transaction delay and are reconnected for every
//! transaction, serial lines get 35 ms and are kept open indefinitely
//! (opening a serial port is expensive and exclusive).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Serial line parameters
// =============================================================================

/// Number of data bits on a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits (default).
    #[default]
    Eight,
}

/// Parity of a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    /// No parity (default).
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Stop bits of a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit (default).
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Framing used on a serial Modbus line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialEncoding {
    /// Binary RTU framing (default).
    #[default]
    Rtu,
    /// ASCII framing.
    Ascii,
}

// =============================================================================
// EndpointKey
// =============================================================================

/// Canonical identity of a physical Modbus link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKey {
    /// Modbus TCP slave.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port, usually 502.
        port: u16,
    },
    /// Modbus-TCP framing over UDP.
    Udp {
        /// Host name or IP address.
        host: String,
        /// UDP port.
        port: u16,
    },
    /// Serial slave behind a local port.
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`.
        device: String,
        /// Baud rate.
        baud: u32,
        /// Data bits.
        data_bits: DataBits,
        /// Parity.
        parity: Parity,
        /// Stop bits.
        stop_bits: StopBits,
        /// RTU or ASCII framing.
        encoding: SerialEncoding,
    },
}

impl EndpointKey {
    /// TCP endpoint shorthand.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// UDP endpoint shorthand.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::Udp {
            host: host.into(),
            port,
        }
    }

    /// RTU serial endpoint with standard 8N1 framing.
    pub fn serial_rtu(device: impl Into<String>, baud: u32) -> Self {
        Self::Serial {
            device: device.into(),
            baud,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            encoding: SerialEncoding::Rtu,
        }
    }

    /// Whether this endpoint is a serial line.
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::Serial { .. })
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Self::Serial {
                device,
                baud,
                encoding,
                ..
            } => {
                let enc = match encoding {
                    SerialEncoding::Rtu => "rtu",
                    SerialEncoding::Ascii => "ascii",
                };
                write!(f, "serial://{device}?baud={baud}&encoding={enc}")
            }
        }
    }
}

// =============================================================================
// EndpointPoolConfig
// =============================================================================

/// Default inter-transaction delay for TCP and UDP slaves.
///
/// 60 ms; some PLCs (e.g. Siemens S7-1212) cannot keep up with
/// back-to-back transactions on their factory settings.
pub const DEFAULT_TCP_INTER_TRANSACTION_DELAY: Duration = Duration::from_millis(60);

/// Default inter-transaction delay for serial slaves (35 ms).
pub const DEFAULT_SERIAL_INTER_TRANSACTION_DELAY: Duration = Duration::from_millis(35);

/// Default number of connect attempts per borrow.
pub const DEFAULT_CONNECT_MAX_TRIES: u32 = 3;

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single request/response exchange.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Pool tuning for a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPoolConfig {
    /// Minimum wall time between returning a connection and handing it to
    /// the next borrower (the inter-transaction delay).
    pub passivate_borrow_min: Duration,

    /// Close the connection on return once it is older than this.
    ///
    /// `None` never closes by age; `Some(Duration::ZERO)` closes after every
    /// transaction.
    pub reconnect_after: Option<Duration>,

    /// Connect attempts per borrow before the borrow fails.
    pub connect_max_tries: u32,

    /// Bound on each individual connect attempt.
    pub connect_timeout: Duration,

    /// Settle time after a successful connect before the first transaction.
    pub after_connect_delay: Duration,

    /// Minimum wall time between consecutive connect attempts.
    pub inter_connect_delay: Duration,

    /// Socket/serial read timeout for a single request/response exchange.
    pub operation_timeout: Duration,
}

impl EndpointPoolConfig {
    /// Transport-appropriate defaults for the given endpoint.
    pub fn default_for(key: &EndpointKey) -> Self {
        match key {
            EndpointKey::Tcp { .. } | EndpointKey::Udp { .. } => Self {
                passivate_borrow_min: DEFAULT_TCP_INTER_TRANSACTION_DELAY,
                reconnect_after: Some(Duration::ZERO),
                connect_max_tries: DEFAULT_CONNECT_MAX_TRIES,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                after_connect_delay: Duration::ZERO,
                inter_connect_delay: Duration::ZERO,
                operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            },
            EndpointKey::Serial { .. } => Self {
                passivate_borrow_min: DEFAULT_SERIAL_INTER_TRANSACTION_DELAY,
                // Opening the port is exclusive; keep it open between
                // transactions.
                reconnect_after: None,
                connect_max_tries: DEFAULT_CONNECT_MAX_TRIES,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                after_connect_delay: Duration::ZERO,
                inter_connect_delay: Duration::ZERO,
                operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            },
        }
    }

    /// Sets the inter-transaction delay.
    pub fn with_passivate_borrow_min(mut self, delay: Duration) -> Self {
        self.passivate_borrow_min = delay;
        self
    }

    /// Sets the reconnect-by-age policy.
    pub fn with_reconnect_after(mut self, age: Option<Duration>) -> Self {
        self.reconnect_after = age;
        self
    }

    /// Sets the connect retry budget.
    pub fn with_connect_max_tries(mut self, tries: u32) -> Self {
        self.connect_max_tries = tries.max(1);
        self
    }

    /// Sets the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the post-connect settle delay.
    pub fn with_after_connect_delay(mut self, delay: Duration) -> Self {
        self.after_connect_delay = delay;
        self
    }

    /// Sets the minimum delay between connect attempts.
    pub fn with_inter_connect_delay(mut self, delay: Duration) -> Self {
        self.inter_connect_delay = delay;
        self
    }

    /// Sets the per-exchange read timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
