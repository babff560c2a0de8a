//! BLE GATT client for sensor peripherals that stream readings over
//! notifications.

pub mod domain;
pub mod infrastructure;
