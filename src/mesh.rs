//! Boundary to the external mesh network stack.
//!
//! The mesh stack owns keys, segmentation, encryption and model dispatch.
//! [`MeshBridge`] feeds it Data Out frames along with the current ATT MTU,
//! pushes the PDUs it produces through the transport, and turns the Sensor
//! Status parameters it hands back into [`SensorReading`]s.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::sensor::{decode, SensorReading};
use crate::transport::{GattTransport, TransportEvent};
use crate::utils::hex_preview;

/// Generic Level value for 0 %.
pub const LEVEL_MIN: i16 = -32767;
/// Generic Level value for 100 %.
pub const LEVEL_MAX: i16 = 32767;

/// External mesh network stack.
#[cfg_attr(test, mockall::automock)]
pub trait MeshStack: Send + Sync {
    /// Process a proxy PDU received from the node. `mtu` is the ATT MTU of
    /// the link it arrived on.
    fn handle_notification(&self, mtu: u32, pdu: &[u8]);

    /// Build a Generic Level Set Unacknowledged message for `destination`.
    /// The resulting PDUs come back through [`MeshBridge::send_pdu`].
    fn send_generic_level(&self, destination: u16, level: i16, tid: u8) -> Result<()>;

    /// Build a Sensor Get message for `destination`.
    fn send_sensor_get(&self, destination: u16) -> Result<()>;
}

/// Map a brightness percentage onto the signed Generic Level range.
///
/// Values above 100 are treated as 100.
///
/// # Example
///
/// ```
/// use mesh_proxy_ble::mesh::brightness_to_level;
///
/// assert_eq!(brightness_to_level(50), 0);
/// assert_eq!(brightness_to_level(100), 32767);
/// ```
pub fn brightness_to_level(percent: u8) -> i16 {
    let percent = f64::from(percent.min(100));
    let level = ((percent - 50.0) * 655.35) as i32;
    level.clamp(i32::from(LEVEL_MIN), i32::from(LEVEL_MAX)) as i16
}

/// Wrapping transaction identifier for Generic Level messages.
#[derive(Debug, Default)]
pub struct TransactionId(AtomicU8);

impl TransactionId {
    /// Create a counter whose first value is `start`.
    pub fn new(start: u8) -> Self {
        Self(AtomicU8::new(start))
    }

    /// Take the next identifier.
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Identifier the next message will use.
    pub fn peek(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Events published by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A decoded sensor value.
    Reading(SensorReading),
    /// Human-readable progress or failure message.
    Status(String),
}

/// Glue between a [`GattTransport`] and a [`MeshStack`].
pub struct MeshBridge {
    transport: Arc<GattTransport>,
    stack: Arc<dyn MeshStack>,
    tid: TransactionId,
    event_tx: broadcast::Sender<MeshEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MeshBridge {
    /// Create a bridge. Call [`start`](Self::start) to begin forwarding.
    pub fn new(transport: Arc<GattTransport>, stack: Arc<dyn MeshStack>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            transport,
            stack,
            tid: TransactionId::default(),
            event_tx,
            pump: Mutex::new(None),
        }
    }

    /// Forward received frames to the mesh stack.
    pub fn start(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            debug!("Mesh bridge already running");
            return;
        }

        let mut events = self.transport.subscribe();
        let transport = Arc::downgrade(&self.transport);
        let stack = self.stack.clone();
        *pump = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::FrameReceived(frame)) => {
                        let Some(transport) = transport.upgrade() else {
                            break;
                        };
                        let mtu = transport.current_mtu();
                        trace!("To mesh stack (MTU={}): {}", mtu, hex_preview(&frame, 20));
                        stack.handle_notification(mtu, &frame);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("Mesh bridge dropped {} transport events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Mesh bridge pump ended");
        }));
    }

    /// Stop forwarding frames.
    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Subscribe to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    /// ATT MTU the mesh stack should segment for.
    pub fn mtu(&self) -> u32 {
        self.transport.current_mtu()
    }

    /// Send a PDU produced by the mesh stack.
    ///
    /// # Errors
    ///
    /// Passes through [`GattTransport::send`] errors, after publishing a
    /// status message.
    pub fn send_pdu(&self, pdu: &[u8]) -> Result<()> {
        self.transport.send(pdu).map_err(|e| {
            warn!("Dropping {} byte PDU: {}", pdu.len(), e);
            self.status(format!("Send failed: {}", e));
            e
        })
    }

    /// Decode Sensor Status parameters from `source` and publish the
    /// readings. Returns how many were found.
    pub fn on_sensor_status(&self, source: u16, parameters: &[u8]) -> usize {
        let mut readings = decode(source, parameters);
        let mut count = 0;
        for reading in readings.by_ref() {
            info!(
                "Temperature from 0x{:04X}: {:.1}°C",
                reading.source_address, reading.value
            );
            let _ = self.event_tx.send(MeshEvent::Reading(reading));
            count += 1;
        }
        if !readings.issues().is_empty() {
            debug!(
                "Sensor status from 0x{:04X} had {} issue(s)",
                source,
                readings.issues().len()
            );
        }
        count
    }

    /// Set the light level of `destination` to `percent` (0-100).
    ///
    /// # Errors
    ///
    /// Returns the mesh stack's error when the message cannot be built.
    pub fn set_brightness(&self, destination: u16, percent: u8) -> Result<()> {
        let level = brightness_to_level(percent);
        let tid = self.tid.next();
        info!(
            "Brightness {}% -> 0x{:04X} (level={}, TID={})",
            percent, destination, level, tid
        );
        match self.stack.send_generic_level(destination, level, tid) {
            Ok(()) => {
                self.status(format!(
                    "Sent level {} to 0x{:04X} (TID {})",
                    level, destination, tid
                ));
                Ok(())
            }
            Err(e) => {
                warn!("Failed to build level message: {}", e);
                self.status(format!("Send failed: {}", e));
                Err(e)
            }
        }
    }

    /// Ask `destination` for its sensor values.
    ///
    /// # Errors
    ///
    /// Returns the mesh stack's error when the message cannot be built.
    pub fn read_temperature(&self, destination: u16) -> Result<()> {
        debug!("Reading temperature from 0x{:04X}", destination);
        self.stack.send_sensor_get(destination).map_err(|e| {
            warn!("Failed to build sensor get: {}", e);
            self.status(format!("Temperature read failed: {}", e));
            e
        })
    }

    fn status(&self, message: String) {
        let _ = self.event_tx.send(MeshEvent::Status(message));
    }
}

impl Drop for MeshBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::radio::RadioStack;
    use crate::ble::simulated::SimulatedRadio;
    use crate::error::Error;
    use crate::sensor::PRESENT_AMBIENT_TEMPERATURE;
    use crate::transport::TransportConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn simulated() -> (Arc<SimulatedRadio>, Arc<GattTransport>) {
        let (radio, rx) = SimulatedRadio::new();
        radio.set_auto_respond(true);
        radio.set_peer_mtu(247);
        let radio = Arc::new(radio);
        let stack: Arc<dyn RadioStack> = radio.clone();
        let transport = GattTransport::with_config(
            stack,
            TransportConfig::default()
                .with_mtu_fallback_delay(Duration::ZERO)
                .with_discovery_delay(Duration::ZERO),
        );
        transport.attach(rx);
        (radio, transport)
    }

    async fn wait_ready(transport: &GattTransport) {
        let mut rx = transport.subscribe();
        while !transport.is_ready() {
            let _ = rx.recv().await;
        }
    }

    #[test]
    fn test_brightness_to_level() {
        assert_eq!(brightness_to_level(0), LEVEL_MIN);
        assert_eq!(brightness_to_level(50), 0);
        assert_eq!(brightness_to_level(100), LEVEL_MAX);
        assert_eq!(brightness_to_level(75), 16383);
        assert_eq!(brightness_to_level(200), LEVEL_MAX);
    }

    #[test]
    fn test_transaction_id_wraps() {
        let tid = TransactionId::new(254);
        assert_eq!(tid.next(), 254);
        assert_eq!(tid.next(), 255);
        assert_eq!(tid.next(), 0);
        assert_eq!(tid.peek(), 1);
    }

    #[tokio::test]
    async fn test_sensor_status_publishes_readings() {
        let (_radio, transport) = simulated();
        let bridge = MeshBridge::new(transport, Arc::new(MockMeshStack::new()));
        let mut rx = bridge.subscribe();

        assert_eq!(bridge.on_sensor_status(0x0003, &[0x02, 0x00, 0x3E, 0x80]), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            MeshEvent::Reading(SensorReading {
                source_address: 0x0003,
                property_id: PRESENT_AMBIENT_TEMPERATURE,
                value: -1.0,
            })
        );
    }

    #[tokio::test]
    async fn test_send_pdu_not_ready() {
        let (_radio, transport) = simulated();
        let bridge = MeshBridge::new(transport, Arc::new(MockMeshStack::new()));
        let mut rx = bridge.subscribe();

        assert!(matches!(
            bridge.send_pdu(&[0x00, 0x01]),
            Err(Error::NotReady { .. })
        ));
        assert!(matches!(rx.try_recv().unwrap(), MeshEvent::Status(_)));
    }

    #[tokio::test]
    async fn test_frames_reach_stack_with_mtu() {
        let (radio, transport) = simulated();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut stack = MockMeshStack::new();
        stack
            .expect_handle_notification()
            .returning(move |mtu, pdu| {
                let _ = seen_tx.send((mtu, pdu.to_vec()));
            });
        let bridge = MeshBridge::new(transport.clone(), Arc::new(stack));
        bridge.start();

        transport.connect("AA:BB:CC:DD:EE:01");
        wait_ready(&transport).await;
        assert_eq!(bridge.mtu(), 247);

        let link = radio.last_link().unwrap();
        radio.inject(
            link,
            crate::ble::radio::RadioEvent::Notification {
                characteristic: crate::ble::uuids::MESH_PROXY_DATA_OUT_UUID,
                value: vec![0x01, 0x02, 0x03],
            },
        );

        assert_eq!(seen_rx.recv().await.unwrap(), (247, vec![0x01, 0x02, 0x03]));
    }

    #[tokio::test]
    async fn test_set_brightness_uses_next_tid() {
        let (_radio, transport) = simulated();
        let mut stack = MockMeshStack::new();
        let mut seq = mockall::Sequence::new();
        stack
            .expect_send_generic_level()
            .withf(|dst, level, tid| *dst == 0x0004 && *level == 0 && *tid == 0)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        stack
            .expect_send_generic_level()
            .withf(|dst, level, tid| *dst == 0x0004 && *level == LEVEL_MAX && *tid == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let bridge = MeshBridge::new(transport, Arc::new(stack));

        bridge.set_brightness(0x0004, 50).unwrap();
        bridge.set_brightness(0x0004, 100).unwrap();
    }

    #[tokio::test]
    async fn test_read_temperature_error_status() {
        let (_radio, transport) = simulated();
        let mut stack = MockMeshStack::new();
        stack
            .expect_send_sensor_get()
            .returning(|_| Err(Error::Internal("no app key".to_string())));
        let bridge = MeshBridge::new(transport, Arc::new(stack));
        let mut rx = bridge.subscribe();

        assert!(bridge.read_temperature(0x0005).is_err());
        assert!(matches!(rx.try_recv().unwrap(), MeshEvent::Status(_)));
    }
}
