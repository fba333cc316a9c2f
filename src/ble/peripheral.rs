//! [`RadioStack`] backed by btleplug.
//!
//! btleplug is async; each request is spawned onto the runtime the radio was
//! created on and its outcome is sent back as a [`RadioCallback`]. Outbound
//! frames go through one writer task per link so they reach the peer in the
//! order they were sent. Tasks are tracked per link and aborted when the link
//! is closed.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::*;
use crate::error::{Error, Result};
use crate::utils::hex_preview;

type Frame = (Characteristic, Vec<u8>);

#[derive(Default)]
struct LinkSlot {
    peripheral: Option<Peripheral>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    tasks: Vec<JoinHandle<()>>,
}

type Links = Arc<RwLock<HashMap<LinkHandle, LinkSlot>>>;

/// A radio stack driving real hardware through btleplug.
///
/// btleplug does not expose the ATT MTU exchange, so
/// [`request_mtu`](RadioStack::request_mtu) always reports that the request
/// could not be dispatched.
pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<RadioCallback>,
    links: Links,
}

impl BtleplugRadio {
    /// Create a radio on the first Bluetooth adapter.
    ///
    /// The returned receiver carries the radio's callbacks; hand it to
    /// [`crate::GattTransport::attach`].
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<RadioCallback>)> {
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

        Self::with_adapter(adapter)
    }

    /// Create a radio on a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn with_adapter(adapter: Adapter) -> Result<(Self, mpsc::UnboundedReceiver<RadioCallback>)> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("No tokio runtime: {}", e)))?;
        let (events, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                adapter,
                runtime,
                events,
                links: Arc::new(RwLock::new(HashMap::new())),
            },
            rx,
        ))
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn peripheral(&self, link: LinkHandle) -> Option<Peripheral> {
        self.links
            .read()
            .get(&link)
            .and_then(|slot| slot.peripheral.clone())
    }

    fn characteristic(&self, link: LinkHandle, uuid: Uuid) -> Option<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(link)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)?;
        Some((peripheral, characteristic))
    }

    fn spawn_for<F>(&self, link: LinkHandle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(task);
        match self.links.write().get_mut(&link) {
            Some(slot) => {
                slot.tasks.retain(|t| !t.is_finished());
                slot.tasks.push(handle);
            }
            None => handle.abort(),
        }
    }

    async fn open_link(
        adapter: Adapter,
        links: Links,
        events: mpsc::UnboundedSender<RadioCallback>,
        link: LinkHandle,
        device: DeviceId,
    ) {
        let emit = |event: RadioEvent| {
            let _ = events.send(RadioCallback { link, event });
        };

        let peripheral = match find_peripheral(&adapter, &device).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!("Device {} not found", device);
                emit(RadioEvent::LinkFailed {
                    status: GATT_FAILURE,
                });
                return;
            }
            Err(e) => {
                warn!("Failed to look up {}: {}", device, e);
                emit(RadioEvent::LinkFailed {
                    status: GATT_FAILURE,
                });
                return;
            }
        };

        match links.write().get_mut(&link) {
            Some(slot) => slot.peripheral = Some(peripheral.clone()),
            None => return,
        }

        if let Err(e) = peripheral.connect().await {
            warn!("Connect to {} failed: {}", device, e);
            emit(match e {
                btleplug::Error::PermissionDenied => RadioEvent::PermissionDenied,
                _ => RadioEvent::LinkFailed {
                    status: GATT_FAILURE,
                },
            });
            return;
        }

        let notifications = tokio::spawn(pump_notifications(
            peripheral.clone(),
            events.clone(),
            link,
        ));
        let watcher = tokio::spawn(watch_disconnect(
            adapter,
            peripheral.clone(),
            events.clone(),
            link,
        ));
        let (writer, frames) = mpsc::unbounded_channel();
        let writes = tokio::spawn(drain_writes(frames, move |(target, data): Frame| {
            let peripheral = peripheral.clone();
            async move {
                if let Err(e) = peripheral
                    .write(&target, &data, WriteType::WithoutResponse)
                    .await
                {
                    warn!("Write of {} bytes failed: {}", data.len(), e);
                }
            }
        }));
        match links.write().get_mut(&link) {
            Some(slot) => {
                slot.writer = Some(writer);
                slot.tasks.extend([notifications, watcher, writes]);
            }
            None => {
                notifications.abort();
                watcher.abort();
                writes.abort();
                return;
            }
        }

        emit(RadioEvent::LinkEstablished);
    }
}

impl RadioStack for BtleplugRadio {
    fn open(&self, link: LinkHandle, device: &DeviceId) -> Result<()> {
        self.links.write().insert(link, LinkSlot::default());
        let task = Self::open_link(
            self.adapter.clone(),
            self.links.clone(),
            self.events.clone(),
            link,
            device.clone(),
        );
        self.spawn_for(link, task);
        Ok(())
    }

    fn request_mtu(&self, _link: LinkHandle, mtu: u16) -> bool {
        debug!("MTU {} requested; exchange is left to the platform", mtu);
        false
    }

    fn discover_services(&self, link: LinkHandle) -> bool {
        let Some(peripheral) = self.peripheral(link) else {
            return false;
        };
        let events = self.events.clone();
        self.spawn_for(link, async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => RadioEvent::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    services: map_services(&peripheral.services()),
                },
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    RadioEvent::ServicesDiscovered {
                        status: GATT_FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            let _ = events.send(RadioCallback { link, event });
        });
        true
    }

    fn enable_notifications(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> bool {
        let Some((peripheral, target)) = self.characteristic(link, characteristic) else {
            return false;
        };
        let events = self.events.clone();
        self.spawn_for(link, async move {
            let status = match peripheral.subscribe(&target).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    error!("Failed to subscribe to {}: {}", target.uuid, e);
                    GATT_FAILURE
                }
            };
            let _ = events.send(RadioCallback {
                link,
                event: RadioEvent::DescriptorWritten { descriptor, status },
            });
        });
        true
    }

    fn write_without_response(&self, link: LinkHandle, characteristic: Uuid, data: &[u8]) -> bool {
        let Some((_, target)) = self.characteristic(link, characteristic) else {
            return false;
        };
        let Some(writer) = self.links.read().get(&link).and_then(|s| s.writer.clone()) else {
            return false;
        };
        writer.send((target, data.to_vec())).is_ok()
    }

    fn close(&self, link: LinkHandle) {
        let Some(slot) = self.links.write().remove(&link) else {
            return;
        };
        for task in slot.tasks {
            task.abort();
        }
        if let Some(peripheral) = slot.peripheral {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect failed: {}", e);
                }
            });
        }
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        for (_, slot) in self.links.write().drain() {
            for task in slot.tasks {
                task.abort();
            }
        }
    }
}

async fn find_peripheral(adapter: &Adapter, device: &DeviceId) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        let address = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .map(|p| p.address.to_string())
            .unwrap_or_default();
        if matches_device(&peripheral.id().to_string(), &address, device) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// Check if a peripheral id or address names `device`.
fn matches_device(id: &str, address: &str, device: &DeviceId) -> bool {
    let wanted = device.as_str();
    id.eq_ignore_ascii_case(wanted) || (!address.is_empty() && address.eq_ignore_ascii_case(wanted))
}

fn map_services(services: &BTreeSet<Service>) -> Vec<GattService> {
    services
        .iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

/// Write queued frames one at a time, in order, until every sender is gone.
async fn drain_writes<T, W, F>(mut frames: mpsc::UnboundedReceiver<T>, mut write: W)
where
    W: FnMut(T) -> F,
    F: Future<Output = ()>,
{
    while let Some(frame) = frames.recv().await {
        write(frame).await;
    }
    trace!("Writer stopped");
}

async fn pump_notifications(
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<RadioCallback>,
    link: LinkHandle,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to get notification stream: {}", e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        trace!(
            "Notification from {}: {}",
            notification.uuid,
            hex_preview(&notification.value, 20)
        );
        let event = RadioEvent::Notification {
            characteristic: notification.uuid,
            value: notification.value,
        };
        if events.send(RadioCallback { link, event }).is_err() {
            break;
        }
    }

    debug!("Notification stream ended for {}", link);
}

async fn watch_disconnect(
    adapter: Adapter,
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<RadioCallback>,
    link: LinkHandle,
) {
    let mut central = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to get adapter events: {}", e);
            return;
        }
    };

    let id = peripheral.id();
    while let Some(event) = central.next().await {
        if let CentralEvent::DeviceDisconnected(gone) = event {
            if gone == id {
                info!("{} disconnected by peer", link);
                let _ = events.send(RadioCallback {
                    link,
                    event: RadioEvent::LinkDropped {
                        status: GATT_FAILURE,
                    },
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use btleplug::api::{CharPropFlags, Descriptor};

    #[test]
    fn test_matches_device() {
        let device = DeviceId::from("aa:bb:cc:dd:ee:ff");
        assert!(matches_device("hci0/dev_x", "AA:BB:CC:DD:EE:FF", &device));
        assert!(matches_device("AA:BB:CC:DD:EE:FF", "", &device));
        assert!(!matches_device("hci0/dev_x", "", &device));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_leave_in_send_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = written.clone();

        let writer = tokio::spawn(drain_writes(rx, move |frame: Vec<u8>| {
            let sink = sink.clone();
            async move {
                // Earlier frames take longer, so any overlap would reorder them.
                let delay = 40u64.saturating_sub(u64::from(frame[0]) * 4);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                sink.lock().push(frame);
            }
        }));

        let sent: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i, 0xAA, 0xBB]).collect();
        for frame in &sent {
            assert!(tx.send(frame.clone()).is_ok());
        }
        drop(tx);
        writer.await.unwrap();

        assert_eq!(*written.lock(), sent);
    }

    #[test]
    fn test_map_services() {
        let data_out = Characteristic {
            uuid: MESH_PROXY_DATA_OUT_UUID,
            service_uuid: MESH_PROXY_SERVICE_UUID,
            properties: CharPropFlags::NOTIFY,
            descriptors: [Descriptor {
                uuid: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                service_uuid: MESH_PROXY_SERVICE_UUID,
                characteristic_uuid: MESH_PROXY_DATA_OUT_UUID,
            }]
            .into_iter()
            .collect(),
        };
        let data_in = Characteristic {
            uuid: MESH_PROXY_DATA_IN_UUID,
            service_uuid: MESH_PROXY_SERVICE_UUID,
            properties: CharPropFlags::WRITE_WITHOUT_RESPONSE,
            descriptors: BTreeSet::new(),
        };
        let services: BTreeSet<Service> = [Service {
            uuid: MESH_PROXY_SERVICE_UUID,
            primary: true,
            characteristics: [data_in, data_out].into_iter().collect(),
        }]
        .into_iter()
        .collect();

        let mapped = map_services(&services);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].uuid, MESH_PROXY_SERVICE_UUID);
        let out = mapped[0].characteristic(&MESH_PROXY_DATA_OUT_UUID).unwrap();
        assert_eq!(out.descriptors, vec![CLIENT_CHARACTERISTIC_CONFIG_UUID]);
        assert!(mapped[0].characteristic(&MESH_PROXY_DATA_IN_UUID).is_some());
    }
}
