// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # busbar-manager
//!
//! Transport manager for shared Modbus endpoints: connection pooling with
//! inter-transaction pacing, a retrying transaction executor, periodic poll
//! scheduling and callback dispatch.
//!
//! Many logical consumers (device handlers, dashboards, rule engines)
//! share a small number of physical links to Modbus slaves. The manager
//! serialises their transactions per endpoint and paces them so the slaves
//! keep up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ModbusManager                            │
//! │        (lifecycle, submissions, config broadcast)               │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                     │
//!            ▼                                     ▼
//! ┌─────────────────────┐             ┌─────────────────────────────┐
//! │    PollRegistry     │             │       ConnectionPool        │
//! │ (fixed-rate loops)  │             │ (per-endpoint slot, pacing) │
//! └─────────────────────┘             └─────────────────────────────┘
//!            │                                     │
//!            └────────────► Executor ◄─────────────┘
//!                    (retry/reconnect per error kind)
//!                               │
//!                               ▼
//!                     Link (tokio-modbus / UDP)
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use busbar_core::{EndpointKey, ReadFunction, ReadRequest, ReadTask};
//! use busbar_manager::{ManagerConfig, ModbusManager};
//!
//! let manager = ModbusManager::new();
//! manager.activate(ManagerConfig::default())?;
//!
//! let endpoint = EndpointKey::tcp("192.168.1.9", 502);
//! let request = ReadRequest::new(1, ReadFunction::HoldingRegisters, 100, 2, 3)?;
//! let task = ReadTask::new(endpoint, request, &callback);
//! manager.register_regular_poll(task, Duration::from_millis(500), Duration::ZERO);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

mod executor;
pub mod link;
mod manager;
mod pool;
mod scheduler;
pub mod testing;
mod udp;

pub use executor::CancelFlag;
pub use link::{Link, LinkFactory, WireLinkFactory};
pub use manager::{ManagerConfig, ManagerError, ManagerListener, ModbusManager};
pub use scheduler::TaskHandle;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
