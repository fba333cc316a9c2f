// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # mesh-proxy-ble
//!
//! A Rust library for reaching a Bluetooth Mesh network through a GATT
//! Proxy node.
//!
//! The crate turns the callback-driven radio link to a proxy node into a
//! dependable frame pipe, supervises it with bounded retries, and decodes
//! the sensor telemetry that comes back. The mesh network layer itself
//! (keys, segmentation, encryption, model dispatch) is an external
//! collaborator behind the [`MeshStack`] trait.
//!
//! ## Features
//!
//! - **Proxy Discovery**: Find nodes advertising the Mesh Proxy Service
//! - **GATT Transport**: MTU negotiation, service discovery, notification
//!   enablement and write-without-response frames
//! - **Supervision**: Retry budget, saved-proxy fast path, status messages
//! - **Sensor Decoding**: Format A, Format B and vendor ambient temperature
//! - **Generic Level**: Brightness mapping and transaction ids
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_proxy_ble::{
//!     BtleplugRadio, ConnectionSupervisor, GattTransport, MemoryAddressStore, Result,
//!     SupervisorEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (radio, callbacks) = BtleplugRadio::new().await?;
//!     let transport = GattTransport::new(Arc::new(radio));
//!     transport.attach(callbacks);
//!
//!     let supervisor = ConnectionSupervisor::new(transport.clone(), Arc::new(MemoryAddressStore::new()));
//!     let mut events = supervisor.subscribe();
//!     supervisor.connect("AA:BB:CC:DD:EE:FF");
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SupervisorEvent::Status(message) => println!("{}", message),
//!             SupervisorEvent::Connected { address } => {
//!                 println!("Connected to {} (MTU {})", address, transport.current_mtu());
//!                 break;
//!             }
//!             SupervisorEvent::TerminalFailure { message, .. } => {
//!                 eprintln!("{}", message);
//!                 break;
//!             }
//!             SupervisorEvent::Disconnected => break,
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod error;
pub mod mesh;
pub mod sensor;
pub mod supervisor;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use error::{Error, FailureClass, Result};
pub use utils::celsius_to_fahrenheit;

// Re-export commonly used types from submodules
pub use ble::{
    BtleplugRadio, DeviceId, LinkHandle, ProxyCandidate, ProxyScanner, RadioEvent, RadioStack,
    SimulatedRadio,
};
pub use mesh::{brightness_to_level, MeshBridge, MeshEvent, MeshStack, TransactionId};
pub use sensor::{
    decode, DecodeIssue, SensorFormat, SensorProperty, SensorReading, SensorTelemetryDecoder,
    PRESENT_AMBIENT_TEMPERATURE,
};
pub use supervisor::{
    ConnectionSupervisor, FileAddressStore, MemoryAddressStore, ProxyAddressStore, RetryBudget, RetryPolicy,
    SupervisorEvent,
};
pub use transport::{
    ConnectionState, FailureReason, GattTransport, NotificationPolicy, TransportConfig,
    TransportError, TransportEvent,
};
