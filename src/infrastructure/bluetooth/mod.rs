//! Bluetooth Module
//!
//! GATT client for BLE sensor peripherals: discovery, one managed link at a
//! time, notification subscription, and in-order delivery of received data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Command loop - public API is the ServiceHandle)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌─────────────┐  ┌────────────┐
//! │  Scanner  │  │ GattSession │  │ Dispatcher │
//! │           │  │             │  │            │
//! │ - peers   │  │ - lifecycle │  │ - ordered  │
//! │ - dedup   │  │ - CCCD      │  │   queue    │
//! └─────┬─────┘  └──────┬──────┘  └────────────┘
//!       │               │
//!       ▼               ▼
//! ┌─────────────────────────────┐
//! │  Discovery / Transport      │
//! │  (simulated or btleplug)    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Well-known UUIDs and payload helpers
//! - [`transport`] - Radio link abstraction and completion events
//! - [`scanner`] - BLE device discovery
//! - [`session`] - Connection state machine for one peer
//! - [`dispatcher`] - Thread-safe FIFO of received data and state changes
//! - [`service`] - Main service coordinator

pub mod capability;
pub mod dispatcher;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

// Re-export main service for convenience
pub use service::{BluetoothService, ServiceHandle};
