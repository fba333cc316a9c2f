//! Proxy connection and temperature monitor example
//!
//! Run with: cargo run --example proxy_monitor
//! Without hardware: cargo run --example proxy_monitor -- --simulate

use mesh_proxy_ble::{
    ConnectionSupervisor, FileAddressStore, GattTransport, MemoryAddressStore, MeshBridge,
    MeshEvent, MeshStack, ProxyAddressStore, ProxyScanner, RadioEvent, Result, SimulatedRadio,
    SupervisorEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stand-in for a real mesh stack. Outgoing messages are plain access
/// payloads with no network or transport layer.
struct ConsoleStack {
    pdus: mpsc::UnboundedSender<Vec<u8>>,
}

impl MeshStack for ConsoleStack {
    fn handle_notification(&self, mtu: u32, pdu: &[u8]) {
        println!("  <- {} bytes (MTU {}): {:02X?}", pdu.len(), mtu, pdu);
    }

    fn send_generic_level(&self, _destination: u16, level: i16, tid: u8) -> Result<()> {
        let mut pdu = vec![0x82, 0x07];
        pdu.extend_from_slice(&level.to_le_bytes());
        pdu.push(tid);
        let _ = self.pdus.send(pdu);
        Ok(())
    }

    fn send_sensor_get(&self, _destination: u16) -> Result<()> {
        let _ = self.pdus.send(vec![0x82, 0x31]);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let simulate = std::env::args().any(|a| a == "--simulate");

    println!("Mesh Proxy Monitor");
    println!("==================\n");

    let (pdu_tx, mut pdu_rx) = mpsc::unbounded_channel();
    let stack = Arc::new(ConsoleStack { pdus: pdu_tx });

    let simulated = if simulate {
        let (radio, callbacks) = SimulatedRadio::new();
        radio.set_auto_respond(true);
        radio.set_peer_mtu(69);
        Some((Arc::new(radio), callbacks))
    } else {
        None
    };

    let (transport, scanner, sim_radio) = match simulated {
        Some((radio, callbacks)) => {
            let transport = GattTransport::new(radio.clone());
            transport.attach(callbacks);
            (transport, None, Some(radio))
        }
        None => {
            let (radio, callbacks) = mesh_proxy_ble::BtleplugRadio::new().await?;
            let transport = GattTransport::new(Arc::new(radio));
            transport.attach(callbacks);
            let scanner = ProxyScanner::new().await?;
            scanner.start_scanning().await?;
            (transport, Some(scanner), None)
        }
    };

    let bridge = MeshBridge::new(transport.clone(), stack);
    bridge.start();
    let mut mesh_events = bridge.subscribe();

    let store: Arc<dyn ProxyAddressStore> = match &scanner {
        Some(_) => Arc::new(FileAddressStore::new(
            std::env::temp_dir().join("mesh-proxy-monitor.address"),
        )),
        None => Arc::new(MemoryAddressStore::new()),
    };
    let supervisor = ConnectionSupervisor::new(transport.clone(), store);
    let mut events = supervisor.subscribe();

    match &scanner {
        Some(scanner) => {
            if supervisor.has_saved_proxy().await? {
                supervisor.connect_saved().await?;
            } else {
                println!("Looking for proxy nodes...\n");
                supervisor.connect_first_candidate(scanner.candidates()).await?;
            }
        }
        None => supervisor.connect("SIM:00:00:00:00:01"),
    }

    println!("Press Ctrl+C to exit.\n");

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut brightness = 0u8;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            Ok(event) = events.recv() => match event {
                SupervisorEvent::Status(message) => println!("[status] {}", message),
                SupervisorEvent::Connected { address } => {
                    println!("Connected to {} (MTU {})\n", address, transport.current_mtu());
                }
                SupervisorEvent::Disconnected => println!("Disconnected"),
                SupervisorEvent::TerminalFailure { message, .. } => {
                    println!("Giving up: {}", message);
                    break;
                }
            },
            Ok(event) = mesh_events.recv() => match event {
                MeshEvent::Reading(reading) => println!(
                    "Temperature from 0x{:04X}: {:.1}°C",
                    reading.source_address, reading.value
                ),
                MeshEvent::Status(message) => println!("[mesh] {}", message),
            },
            Some(pdu) = pdu_rx.recv() => {
                if bridge.send_pdu(&pdu).is_ok() {
                    println!("  -> {:02X?}", pdu);
                }
            }
            _ = ticker.tick() => {
                if !transport.is_ready() {
                    continue;
                }
                brightness = (brightness + 25) % 125;
                let _ = bridge.set_brightness(0x0002, brightness);
                let _ = bridge.read_temperature(0x0003);

                if let Some(radio) = &sim_radio {
                    if let Some(link) = radio.last_link() {
                        radio.inject(link, RadioEvent::Notification {
                            characteristic: mesh_proxy_ble::ble::MESH_PROXY_DATA_OUT_UUID,
                            value: vec![0x02, 0x00, 0x3E, 0x80],
                        });
                    }
                    // The simulated node reports -1.0°C in the vendor encoding.
                    bridge.on_sensor_status(0x0003, &[0x02, 0x00, 0x3E, 0x80]);
                }
            }
        }
    }

    supervisor.disconnect();
    bridge.stop();
    if let Some(scanner) = scanner {
        scanner.stop_scanning().await?;
    }

    Ok(())
}
