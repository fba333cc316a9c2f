//! BLE Service and Characteristic UUIDs.
//!
//! Contains the Bluetooth Mesh Proxy GATT identifiers and ATT MTU limits.

use uuid::Uuid;

/// Mesh Proxy Service UUID (0x1828).
pub const MESH_PROXY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1828_0000_1000_8000_00805f9b34fb);
/// Mesh Proxy Data In characteristic UUID (write without response, to the node).
pub const MESH_PROXY_DATA_IN_UUID: Uuid = Uuid::from_u128(0x0000_2add_0000_1000_8000_00805f9b34fb);
/// Mesh Proxy Data Out characteristic UUID (notify, from the node).
pub const MESH_PROXY_DATA_OUT_UUID: Uuid = Uuid::from_u128(0x0000_2ade_0000_1000_8000_00805f9b34fb);
/// Client Characteristic Configuration Descriptor UUID (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// ATT MTU every link supports without negotiation.
pub const MIN_ATT_MTU: u16 = 23;
/// ATT MTU requested after the link comes up.
pub const TARGET_ATT_MTU: u16 = 517;

/// Check if a service UUID is the mesh proxy service.
pub fn is_proxy_service(uuid: &Uuid) -> bool {
    *uuid == MESH_PROXY_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            MESH_PROXY_SERVICE_UUID.to_string(),
            "00001828-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            MESH_PROXY_DATA_IN_UUID.to_string(),
            "00002add-0000-1000-8000-00805f9b34fb"
        );
        assert!(MESH_PROXY_DATA_OUT_UUID.to_string().contains("2ade"));
        assert!(CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string().contains("2902"));
    }

    #[test]
    fn test_is_proxy_service() {
        assert!(is_proxy_service(&MESH_PROXY_SERVICE_UUID));
        // Provisioning service, advertised by unprovisioned nodes.
        let provisioning = Uuid::from_u128(0x0000_1827_0000_1000_8000_00805f9b34fb);
        assert!(!is_proxy_service(&provisioning));
    }
}
