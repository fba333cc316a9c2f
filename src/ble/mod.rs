//! BLE communication module.
//!
//! This module provides the radio side of the proxy link: the GATT
//! identifiers, the [`RadioStack`] seam the transport drives, a btleplug
//! implementation of it, an in-process simulator, and proxy discovery.

pub mod peripheral;
pub mod radio;
pub mod scanner;
pub mod simulated;
pub mod uuids;

pub use peripheral::BtleplugRadio;
pub use radio::{
    DeviceId, GattCharacteristic, GattService, LinkHandle, RadioCallback, RadioEvent, RadioStack,
};
pub use scanner::{ProxyCandidate, ProxyScanner};
pub use simulated::{RadioRequest, SimulatedRadio};
pub use uuids::*;
