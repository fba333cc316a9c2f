//! The boundary between the transport and a concrete Bluetooth stack.
//!
//! Radio stacks are request/callback driven: a request is *dispatched* and
//! returns immediately, and its outcome arrives later as a [`RadioEvent`]
//! tagged with the [`LinkHandle`] it belongs to. Events for a handle that has
//! since been released are dropped by the transport.

use std::fmt;

use uuid::Uuid;

use crate::ble::uuids::*;
use crate::error::Result;

/// Status reported for a successful GATT operation.
pub const GATT_SUCCESS: i32 = 0;
/// Generic GATT failure status.
pub const GATT_FAILURE: i32 = 0x101;
/// Status used when a request could not even be handed to the radio stack.
pub const STATUS_NOT_DISPATCHED: i32 = -1;

/// Opaque identifier for one radio connection.
///
/// A new handle is allocated for every connection attempt and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(u64);

impl LinkHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Identifier the radio stack uses to reach a peer (a MAC address on most
/// platforms, a UUID on macOS).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptor UUIDs attached to the characteristic.
    pub descriptors: Vec<Uuid>,
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of this service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// The service table a well-formed mesh proxy node exposes.
    pub fn mesh_proxy() -> Self {
        Self {
            uuid: MESH_PROXY_SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: MESH_PROXY_DATA_IN_UUID,
                    descriptors: Vec::new(),
                },
                GattCharacteristic {
                    uuid: MESH_PROXY_DATA_OUT_UUID,
                    descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
                },
            ],
        }
    }

    /// Find a characteristic of this service by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Outcome callbacks from the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// The physical link is up.
    LinkEstablished,
    /// The link could not be established.
    LinkFailed {
        /// Status code from the stack.
        status: i32,
    },
    /// The platform refused access to the radio.
    PermissionDenied,
    /// An established link went away.
    LinkDropped {
        /// Status code from the stack.
        status: i32,
    },
    /// Result of an MTU exchange.
    MtuChanged {
        /// The MTU reported by the stack.
        mtu: u16,
        /// Status code; the MTU is only meaningful on [`GATT_SUCCESS`].
        status: i32,
    },
    /// Result of service discovery.
    ServicesDiscovered {
        /// Status code from the stack.
        status: i32,
        /// Discovered services (empty on failure).
        services: Vec<GattService>,
    },
    /// Acknowledgement of a descriptor write.
    DescriptorWritten {
        /// Descriptor that was written.
        descriptor: Uuid,
        /// Status code from the stack.
        status: i32,
    },
    /// A characteristic value notification.
    Notification {
        /// Characteristic that notified.
        characteristic: Uuid,
        /// Notified value.
        value: Vec<u8>,
    },
}

/// A radio event together with the link it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioCallback {
    /// Link the event belongs to.
    pub link: LinkHandle,
    /// The event.
    pub event: RadioEvent,
}

/// A Bluetooth stack capable of driving one GATT client link per handle.
///
/// Every method dispatches a request and returns without waiting for the
/// peer. Implementations must deliver outcomes asynchronously (never by
/// calling back into the transport from inside one of these methods).
pub trait RadioStack: Send + Sync {
    /// Start connecting to `device`. Outcome: `LinkEstablished`,
    /// `LinkFailed` or `PermissionDenied`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PermissionDenied`] when the platform refuses
    /// the request outright, or another error when it cannot be dispatched.
    fn open(&self, link: LinkHandle, device: &DeviceId) -> Result<()>;

    /// Request an ATT MTU exchange. Outcome: `MtuChanged`.
    ///
    /// Returns `false` if the request could not be dispatched.
    fn request_mtu(&self, link: LinkHandle, mtu: u16) -> bool;

    /// Start service discovery. Outcome: `ServicesDiscovered`.
    fn discover_services(&self, link: LinkHandle) -> bool;

    /// Enable notifications on `characteristic` by writing its configuration
    /// `descriptor`. Outcome: `DescriptorWritten`, followed by
    /// `Notification`s.
    fn enable_notifications(&self, link: LinkHandle, characteristic: Uuid, descriptor: Uuid)
        -> bool;

    /// Queue a write-without-response. Returns whether the stack accepted the
    /// request, not whether the peer received it.
    fn write_without_response(&self, link: LinkHandle, characteristic: Uuid, data: &[u8]) -> bool;

    /// Release the link. Must tolerate handles that never came up.
    fn close(&self, link: LinkHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_proxy_service_table() {
        let service = GattService::mesh_proxy();
        assert_eq!(service.uuid, MESH_PROXY_SERVICE_UUID);
        assert!(service.characteristic(&MESH_PROXY_DATA_IN_UUID).is_some());
        let data_out = service
            .characteristic(&MESH_PROXY_DATA_OUT_UUID)
            .expect("data out present");
        assert_eq!(data_out.descriptors, vec![CLIENT_CHARACTERISTIC_CONFIG_UUID]);
    }

    #[test]
    fn test_device_id_conversions() {
        let id: DeviceId = "AA:BB:CC:DD:EE:FF".into();
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id, DeviceId::new(String::from("AA:BB:CC:DD:EE:FF")));
        assert_eq!(LinkHandle::new(7).to_string(), "link#7");
    }
}
