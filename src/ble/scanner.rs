//! BLE scanning functionality.
//!
//! Provides the scanner for discovering provisioned mesh nodes that accept
//! proxy connections.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::uuids::MESH_PROXY_SERVICE_UUID;
use crate::error::{Error, Result};

/// A node advertising the mesh proxy service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxyCandidate {
    /// Identifier to pass to the transport.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm at discovery.
    pub rssi: Option<i16>,
}

/// Check if an advertisement announces the mesh proxy service.
pub fn is_proxy_advertisement(services: &[Uuid], service_data: &HashMap<Uuid, Vec<u8>>) -> bool {
    services.contains(&MESH_PROXY_SERVICE_UUID) || service_data.contains_key(&MESH_PROXY_SERVICE_UUID)
}

/// BLE scanner for discovering mesh proxy nodes.
pub struct ProxyScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Discovered proxies, by address.
    discovered: Arc<RwLock<HashMap<String, ProxyCandidate>>>,
    /// Channel for newly discovered proxies.
    event_tx: broadcast::Sender<ProxyCandidate>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl ProxyScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning for proxy nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for mesh proxy nodes");

        self.adapter
            .start_scan(ScanFilter {
                services: vec![MESH_PROXY_SERVICE_UUID],
            })
            .await?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        Self::handle_event(event, &adapter, &discovered, &event_tx).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Get all discovered proxies.
    pub fn discovered_proxies(&self) -> Vec<ProxyCandidate> {
        self.discovered.read().values().cloned().collect()
    }

    /// Subscribe to newly discovered proxies.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyCandidate> {
        self.event_tx.subscribe()
    }

    /// Proxies seen so far followed by new ones as they are discovered,
    /// each address at most once.
    pub fn candidates(&self) -> impl Stream<Item = ProxyCandidate> + Send + 'static {
        let rx = self.event_tx.subscribe();
        let known = self.discovered_proxies();
        candidate_stream(known, rx)
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        discovered: &Arc<RwLock<HashMap<String, ProxyCandidate>>>,
        event_tx: &broadcast::Sender<ProxyCandidate>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, discovered, event_tx).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if services.contains(&MESH_PROXY_SERVICE_UUID) {
                    Self::process_peripheral(adapter, id, discovered, event_tx).await;
                }
            }
            CentralEvent::ServiceDataAdvertisement { id, service_data } => {
                if service_data.contains_key(&MESH_PROXY_SERVICE_UUID) {
                    Self::process_peripheral(adapter, id, discovered, event_tx).await;
                }
            }
            _ => {}
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        discovered: &Arc<RwLock<HashMap<String, ProxyCandidate>>>,
        event_tx: &broadcast::Sender<ProxyCandidate>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        if !is_proxy_advertisement(&properties.services, &properties.service_data) {
            return;
        }

        let candidate = ProxyCandidate {
            address: id.to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
        };

        let is_new = {
            let mut discovered = discovered.write();
            let is_new = !discovered.contains_key(&candidate.address);
            discovered.insert(candidate.address.clone(), candidate.clone());
            is_new
        };

        if is_new {
            info!(
                "Found proxy {} ({:?}, RSSI {:?})",
                candidate.address, candidate.name, candidate.rssi
            );
            let _ = event_tx.send(candidate);
        }
    }
}

impl Drop for ProxyScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}

/// `known` followed by everything received on `rx`, skipping repeated
/// addresses.
fn candidate_stream(
    known: Vec<ProxyCandidate>,
    rx: broadcast::Receiver<ProxyCandidate>,
) -> impl Stream<Item = ProxyCandidate> + Send + 'static {
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(candidate) => return Some((candidate, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Proxy candidate stream lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let mut seen = HashSet::new();
    stream::iter(known)
        .chain(live)
        .filter(move |c| futures::future::ready(seen.insert(c.address.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVISIONING_SERVICE: Uuid = Uuid::from_u128(0x0000_1827_0000_1000_8000_00805f9b34fb);

    fn candidate(address: &str) -> ProxyCandidate {
        ProxyCandidate {
            address: address.to_string(),
            name: Some("Mesh Light".to_string()),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_is_proxy_advertisement() {
        let empty = HashMap::new();
        assert!(is_proxy_advertisement(&[MESH_PROXY_SERVICE_UUID], &empty));
        assert!(!is_proxy_advertisement(&[PROVISIONING_SERVICE], &empty));

        let mut data = HashMap::new();
        data.insert(MESH_PROXY_SERVICE_UUID, vec![0x00, 0x01]);
        assert!(is_proxy_advertisement(&[], &data));
    }

    #[tokio::test]
    async fn test_candidate_stream_dedupes() {
        let (tx, rx) = broadcast::channel(8);
        let stream = candidate_stream(vec![candidate("A")], rx);
        tx.send(candidate("A")).unwrap();
        tx.send(candidate("B")).unwrap();
        drop(tx);

        let addresses: Vec<_> = stream.map(|c| c.address).collect().await;
        assert_eq!(addresses, vec!["A".to_string(), "B".to_string()]);
    }
}
