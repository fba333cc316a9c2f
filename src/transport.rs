//! GATT transport to a mesh proxy node.
//!
//! [`GattTransport`] drives one radio link from connect through MTU
//! negotiation, service discovery and notification enablement to a ready
//! state in which raw proxy PDUs can be exchanged. Every transition is
//! applied under a single lock, and everything observable about the link is
//! published on one broadcast channel of [`TransportEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::*;
use crate::ble::uuids::*;
use crate::error::{Error, FailureClass, Result};
use crate::utils::hex_preview;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureReason {
    /// The platform refused access to the radio.
    PermissionDenied,
    /// Link-level failure with the stack's status code.
    LinkFailure(i32),
    /// The peer is not a mesh proxy.
    ServiceMissing,
    /// Setup did not finish within the configured timeout.
    SetupTimeout,
}

impl FailureReason {
    /// Convert into the crate error type.
    pub fn to_error(&self) -> Error {
        match self {
            Self::PermissionDenied => Error::PermissionDenied,
            Self::LinkFailure(code) => Error::LinkFailure { code: *code },
            Self::ServiceMissing => Error::ServiceMissing {
                uuid: MESH_PROXY_SERVICE_UUID.to_string(),
            },
            Self::SetupTimeout => Error::SetupTimeout,
        }
    }

    /// Retry classification of this failure.
    pub fn class(&self) -> FailureClass {
        self.to_error().class()
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::LinkFailure(code) => write!(f, "link failure (status {})", code),
            Self::ServiceMissing => write!(f, "mesh proxy service missing"),
            Self::SetupTimeout => write!(f, "setup timeout"),
        }
    }
}

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Idle,
    /// Waiting for the radio link to come up.
    Connecting,
    /// Exchanging the ATT MTU.
    NegotiatingMtu,
    /// Looking for the mesh proxy service.
    DiscoveringServices,
    /// Enabling Data Out notifications.
    EnablingNotifications,
    /// Frames can be exchanged.
    Ready,
    /// Tearing the link down.
    Disconnecting,
    /// The attempt failed; the link is being released.
    Failed(FailureReason),
}

impl ConnectionState {
    /// Check if frames can be sent.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if an attempt is on its way to `Ready`.
    pub fn is_setting_up(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::NegotiatingMtu
                | Self::DiscoveringServices
                | Self::EnablingNotifications
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::NegotiatingMtu => write!(f, "NegotiatingMtu"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::EnablingNotifications => write!(f, "EnablingNotifications"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// A classified failure published on the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// What went wrong.
    pub reason: FailureReason,
    /// Human readable description.
    pub message: String,
}

impl TransportError {
    /// Retry classification of this failure.
    pub fn class(&self) -> FailureClass {
        self.reason.class()
    }
}

/// Events published by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The state machine moved to a new state.
    StateChanged(ConnectionState),
    /// The radio link came up.
    Connected,
    /// Notifications are enabled and frames can be sent.
    ServicesReady,
    /// A link that had come up is gone.
    Disconnected,
    /// A Data Out notification.
    FrameReceived(Bytes),
    /// A connection attempt failed.
    Error(TransportError),
}

/// When to consider notification enablement complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NotificationPolicy {
    /// Enter `Ready` as soon as the CCCD write is dispatched. A failed
    /// acknowledgement is only logged. Frames written immediately after
    /// `Ready` may reach a peer that has not yet processed the CCCD write.
    #[default]
    Optimistic,
    /// Enter `Ready` only after a successful CCCD write acknowledgement.
    AwaitAck,
}

/// Transport tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// MTU requested after the link comes up.
    pub target_mtu: u16,
    /// Delay before discovery when the MTU request could not be dispatched.
    pub mtu_fallback_delay: Duration,
    /// How long to wait for an MTU response before carrying on without one.
    pub mtu_response_timeout: Duration,
    /// Settle delay between the MTU outcome and service discovery.
    pub discovery_delay: Duration,
    /// Upper bound for the whole connect-to-ready sequence.
    pub setup_timeout: Duration,
    /// When notification enablement counts as complete.
    pub notification_policy: NotificationPolicy,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            target_mtu: TARGET_ATT_MTU,
            mtu_fallback_delay: Duration::from_millis(600),
            mtu_response_timeout: Duration::from_secs(2),
            discovery_delay: Duration::from_millis(300),
            setup_timeout: Duration::from_secs(15),
            notification_policy: NotificationPolicy::Optimistic,
            event_capacity: 64,
        }
    }
}

impl TransportConfig {
    /// Set the MTU requested after connecting.
    pub fn with_target_mtu(mut self, mtu: u16) -> Self {
        self.target_mtu = mtu;
        self
    }

    /// Set the MTU fallback delay.
    pub fn with_mtu_fallback_delay(mut self, delay: Duration) -> Self {
        self.mtu_fallback_delay = delay;
        self
    }

    /// Set the settle delay before service discovery.
    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    /// Set the setup timeout.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Set the notification policy.
    pub fn with_notification_policy(mut self, policy: NotificationPolicy) -> Self {
        self.notification_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    MtuFallback,
    DiscoveryDelay,
    SetupTimeout,
}

/// Characteristic written for outbound frames. Bound only while `Ready`.
#[derive(Debug, Clone, Copy)]
struct FrameSink {
    characteristic: Uuid,
}

/// Characteristic notifying inbound frames.
#[derive(Debug, Clone, Copy)]
struct NotifySource {
    characteristic: Uuid,
}

struct ActiveLink {
    handle: LinkHandle,
    device: DeviceId,
    /// Whether `Connected` has been published for this link.
    established: bool,
    data_in: Option<Uuid>,
    sink: Option<FrameSink>,
    source: Option<NotifySource>,
}

struct Timer {
    id: u64,
    task: JoinHandle<()>,
}

struct Machine {
    state: ConnectionState,
    link: Option<ActiveLink>,
    mtu: u16,
    mtu_recorded: bool,
    timers: HashMap<TimerKind, Timer>,
    next_link: u64,
    next_timer: u64,
    last_failure: Option<FailureReason>,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            link: None,
            mtu: MIN_ATT_MTU,
            mtu_recorded: false,
            timers: HashMap::new(),
            next_link: 1,
            next_timer: 1,
            last_failure: None,
        }
    }

    fn current_handle(&self) -> Option<LinkHandle> {
        self.link.as_ref().map(|l| l.handle)
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(timer) = self.timers.remove(&kind) {
            trace!("Cancelling {:?} timer", kind);
            timer.task.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}

/// GATT client transport to a single mesh proxy node.
pub struct GattTransport {
    radio: Arc<dyn RadioStack>,
    config: TransportConfig,
    machine: Mutex<Machine>,
    event_tx: broadcast::Sender<TransportEvent>,
    this: Weak<GattTransport>,
}

impl GattTransport {
    /// Create a transport with the default configuration.
    pub fn new(radio: Arc<dyn RadioStack>) -> Arc<Self> {
        Self::with_config(radio, TransportConfig::default())
    }

    /// Create a transport with a custom configuration.
    pub fn with_config(radio: Arc<dyn RadioStack>, config: TransportConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            radio,
            config,
            machine: Mutex::new(Machine::new()),
            event_tx,
            this: this.clone(),
        })
    }

    /// Feed radio callbacks from `events` into the state machine.
    ///
    /// The task ends when the sender side is dropped or the transport is gone.
    pub fn attach(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<RadioCallback>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(callback) = events.recv().await {
                match this.upgrade() {
                    Some(transport) => transport.handle_radio_event(callback.link, callback.event),
                    None => break,
                }
            }
            debug!("Radio event pump ended");
        })
    }

    /// Subscribe to transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.machine.lock().state
    }

    /// Check if frames can be sent.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Last negotiated ATT MTU, or the link minimum.
    pub fn current_mtu(&self) -> u32 {
        u32::from(self.machine.lock().mtu)
    }

    /// Device of the current link, if any.
    pub fn device(&self) -> Option<DeviceId> {
        self.machine.lock().link.as_ref().map(|l| l.device.clone())
    }

    /// Reason of the most recent failed attempt.
    pub fn last_failure(&self) -> Option<FailureReason> {
        self.machine.lock().last_failure
    }

    /// Get the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Start connecting to `device`.
    ///
    /// Any existing link is released first. Calling this again for the
    /// device that is already connecting or connected is a no-op. Progress is
    /// reported on the event stream.
    pub fn connect(&self, device: impl Into<DeviceId>) {
        let device = device.into();
        let mut m = self.machine.lock();

        if let Some(link) = &m.link {
            if link.device == device && (m.state.is_setting_up() || m.state.is_ready()) {
                debug!("Already {} to {}, ignoring connect", m.state, device);
                return;
            }
        }

        if m.link.is_some() {
            debug!("Releasing previous link before connecting to {}", device);
            self.release_link(&mut m);
        }
        m.cancel_all_timers();

        let handle = LinkHandle::new(m.next_link);
        m.next_link += 1;
        m.mtu = MIN_ATT_MTU;
        m.mtu_recorded = false;
        m.last_failure = None;
        m.link = Some(ActiveLink {
            handle,
            device: device.clone(),
            established: false,
            data_in: None,
            sink: None,
            source: None,
        });

        info!("Connecting to {} ({})", device, handle);
        self.set_state(&mut m, ConnectionState::Connecting);
        self.arm_timer(&mut m, handle, TimerKind::SetupTimeout, self.config.setup_timeout);

        match self.radio.open(handle, &device) {
            Ok(()) => {}
            Err(Error::PermissionDenied) => {
                self.fail(
                    &mut m,
                    FailureReason::PermissionDenied,
                    format!("Bluetooth permission denied while connecting to {}", device),
                );
            }
            Err(e) => {
                self.fail(
                    &mut m,
                    FailureReason::LinkFailure(STATUS_NOT_DISPATCHED),
                    format!("Connect to {} could not be started: {}", device, e),
                );
            }
        }
    }

    /// Send a frame to the proxy with a write-without-response.
    ///
    /// Returns as soon as the radio stack has accepted or refused the write;
    /// delivery to the peer is not confirmed.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] outside `Ready`, [`Error::WriteRejected`] when the
    /// radio stack refuses the write.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let m = self.machine.lock();

        let target = match (&m.state, &m.link) {
            (ConnectionState::Ready, Some(link)) => link.sink.map(|sink| (link.handle, sink)),
            _ => None,
        };
        let (handle, sink) = target.ok_or_else(|| Error::NotReady {
            state: m.state.to_string(),
        })?;

        let payload_limit = usize::from(m.mtu.saturating_sub(3));
        if data.len() > payload_limit {
            warn!(
                "Frame of {} bytes exceeds ATT payload of {} (MTU {})",
                data.len(),
                payload_limit,
                m.mtu
            );
        }

        if self
            .radio
            .write_without_response(handle, sink.characteristic, data)
        {
            trace!(
                "Sent {} bytes (MTU={}): {}",
                data.len(),
                m.mtu,
                hex_preview(data, 20)
            );
            Ok(())
        } else {
            warn!("Radio stack rejected {} byte write", data.len());
            Err(Error::WriteRejected)
        }
    }

    /// Tear the link down from any state. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut m = self.machine.lock();
        m.cancel_all_timers();

        if m.link.is_none() {
            if m.state != ConnectionState::Idle {
                self.set_state(&mut m, ConnectionState::Idle);
            }
            debug!("Nothing to disconnect");
            return;
        }

        info!("Disconnecting");
        self.set_state(&mut m, ConnectionState::Disconnecting);
        self.release_link(&mut m);
        self.set_state(&mut m, ConnectionState::Idle);
    }

    /// Entry point for radio stack callbacks.
    pub fn handle_radio_event(&self, link: LinkHandle, event: RadioEvent) {
        let mut m = self.machine.lock();

        if m.current_handle() != Some(link) {
            trace!("Ignoring {:?} for released {}", event, link);
            return;
        }

        match (m.state, event) {
            (ConnectionState::Connecting, RadioEvent::LinkEstablished) => {
                self.on_link_established(&mut m, link);
            }
            (ConnectionState::Connecting, RadioEvent::LinkFailed { status }) => {
                self.fail(
                    &mut m,
                    FailureReason::LinkFailure(status),
                    format!("Connection failed (status: {})", status),
                );
            }
            (state, RadioEvent::PermissionDenied) if state.is_setting_up() => {
                self.fail(
                    &mut m,
                    FailureReason::PermissionDenied,
                    "Bluetooth permission denied".to_string(),
                );
            }
            (ConnectionState::NegotiatingMtu, RadioEvent::MtuChanged { mtu, status }) => {
                m.cancel_timer(TimerKind::MtuFallback);
                self.record_mtu(&mut m, mtu, status);
                self.begin_discovery(&mut m, link, self.config.discovery_delay);
            }
            (
                ConnectionState::DiscoveringServices,
                RadioEvent::ServicesDiscovered { status, services },
            ) => {
                m.cancel_timer(TimerKind::DiscoveryDelay);
                self.on_services_discovered(&mut m, link, status, &services);
            }
            (
                ConnectionState::EnablingNotifications,
                RadioEvent::DescriptorWritten { descriptor, status },
            ) => {
                if status == GATT_SUCCESS {
                    debug!("Notifications enabled ({})", descriptor);
                    self.enter_ready(&mut m);
                } else {
                    self.fail(
                        &mut m,
                        FailureReason::LinkFailure(status),
                        format!("Enabling notifications failed (status: {})", status),
                    );
                }
            }
            (ConnectionState::Ready, RadioEvent::DescriptorWritten { descriptor, status }) => {
                if status == GATT_SUCCESS {
                    debug!("Notification enable acknowledged ({})", descriptor);
                } else {
                    error!(
                        "Notification enable write failed (status: {}), continuing",
                        status
                    );
                }
            }
            (
                ConnectionState::EnablingNotifications | ConnectionState::Ready,
                RadioEvent::Notification {
                    characteristic,
                    value,
                },
            ) => {
                let is_source = m
                    .link
                    .as_ref()
                    .and_then(|l| l.source)
                    .map(|s| s.characteristic == characteristic)
                    .unwrap_or(false);
                if is_source {
                    trace!(
                        "Received {} bytes: {}",
                        value.len(),
                        hex_preview(&value, 20)
                    );
                    self.emit(TransportEvent::FrameReceived(Bytes::from(value)));
                } else {
                    trace!("Ignoring notification from {}", characteristic);
                }
            }
            (ConnectionState::Ready, RadioEvent::LinkDropped { status })
            | (ConnectionState::Ready, RadioEvent::LinkFailed { status }) => {
                info!("Link dropped (status: {})", status);
                m.cancel_all_timers();
                self.release_link(&mut m);
                self.set_state(&mut m, ConnectionState::Idle);
            }
            (state, RadioEvent::LinkDropped { status })
            | (state, RadioEvent::LinkFailed { status })
                if state.is_setting_up() =>
            {
                self.fail(
                    &mut m,
                    FailureReason::LinkFailure(status),
                    format!("Link dropped during {} (status: {})", state, status),
                );
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {}", event, state);
            }
        }
    }

    fn on_link_established(&self, m: &mut Machine, link: LinkHandle) {
        if let Some(active) = m.link.as_mut() {
            if active.established {
                return;
            }
            active.established = true;
            info!("Link established to {}", active.device);
        }
        self.emit(TransportEvent::Connected);
        self.set_state(m, ConnectionState::NegotiatingMtu);

        let target = self.config.target_mtu;
        if self.radio.request_mtu(link, target) {
            debug!("Requested MTU {}", target);
            self.arm_timer(
                m,
                link,
                TimerKind::MtuFallback,
                self.config.mtu_response_timeout,
            );
        } else if self.config.mtu_fallback_delay.is_zero() {
            warn!("MTU request could not be dispatched, discovering services");
            self.begin_discovery(m, link, Duration::ZERO);
        } else {
            warn!(
                "MTU request could not be dispatched, discovering services in {:?}",
                self.config.mtu_fallback_delay
            );
            self.arm_timer(
                m,
                link,
                TimerKind::MtuFallback,
                self.config.mtu_fallback_delay,
            );
        }
    }

    fn record_mtu(&self, m: &mut Machine, mtu: u16, status: i32) {
        if m.mtu_recorded {
            return;
        }
        m.mtu_recorded = true;
        if status == GATT_SUCCESS && mtu >= MIN_ATT_MTU {
            m.mtu = mtu;
            info!("MTU negotiated: {}", mtu);
        } else {
            warn!(
                "MTU negotiation failed (status: {}), keeping {}",
                status, m.mtu
            );
        }
    }

    /// Move to `DiscoveringServices`, dispatching discovery now or after `delay`.
    fn begin_discovery(&self, m: &mut Machine, link: LinkHandle, delay: Duration) {
        self.set_state(m, ConnectionState::DiscoveringServices);
        if delay.is_zero() {
            self.dispatch_discovery(m, link);
        } else {
            self.arm_timer(m, link, TimerKind::DiscoveryDelay, delay);
        }
    }

    fn dispatch_discovery(&self, m: &mut Machine, link: LinkHandle) {
        if self.radio.discover_services(link) {
            debug!("Discovering services");
        } else {
            self.fail(
                m,
                FailureReason::LinkFailure(STATUS_NOT_DISPATCHED),
                "Service discovery could not be started".to_string(),
            );
        }
    }

    fn on_services_discovered(
        &self,
        m: &mut Machine,
        link: LinkHandle,
        status: i32,
        services: &[GattService],
    ) {
        if status != GATT_SUCCESS {
            self.fail(
                m,
                FailureReason::LinkFailure(status),
                format!("Service discovery failed (status: {})", status),
            );
            return;
        }

        let Some(service) = services.iter().find(|s| is_proxy_service(&s.uuid)) else {
            self.fail(
                m,
                FailureReason::ServiceMissing,
                "Mesh Proxy Service not found".to_string(),
            );
            return;
        };
        debug!("Found Mesh Proxy Service");

        let data_in = service.characteristic(&MESH_PROXY_DATA_IN_UUID);
        let data_out = service.characteristic(&MESH_PROXY_DATA_OUT_UUID);
        let (Some(data_in), Some(data_out)) = (data_in, data_out) else {
            self.fail(
                m,
                FailureReason::ServiceMissing,
                "Mesh Proxy Data In/Out characteristic not found".to_string(),
            );
            return;
        };
        if !data_out.descriptors.is_empty()
            && !data_out.descriptors.contains(&CLIENT_CHARACTERISTIC_CONFIG_UUID)
        {
            self.fail(
                m,
                FailureReason::ServiceMissing,
                "Mesh Proxy Data Out has no configuration descriptor".to_string(),
            );
            return;
        }

        let source = NotifySource {
            characteristic: data_out.uuid,
        };
        if let Some(active) = m.link.as_mut() {
            active.data_in = Some(data_in.uuid);
            active.source = Some(source);
        }

        self.set_state(m, ConnectionState::EnablingNotifications);
        if !self.radio.enable_notifications(
            link,
            source.characteristic,
            CLIENT_CHARACTERISTIC_CONFIG_UUID,
        ) {
            self.fail(
                m,
                FailureReason::LinkFailure(STATUS_NOT_DISPATCHED),
                "Enabling notifications could not be started".to_string(),
            );
            return;
        }
        debug!("Enabling Data Out notifications");

        if self.config.notification_policy == NotificationPolicy::Optimistic {
            self.enter_ready(m);
        }
    }

    fn enter_ready(&self, m: &mut Machine) {
        m.cancel_all_timers();
        if let Some(active) = m.link.as_mut() {
            active.sink = active.data_in.map(|characteristic| FrameSink { characteristic });
            info!("Proxy link to {} ready (MTU {})", active.device, m.mtu);
        }
        self.set_state(m, ConnectionState::Ready);
        self.emit(TransportEvent::ServicesReady);
    }

    /// Record a failed attempt, release the link and return to `Idle`.
    fn fail(&self, m: &mut Machine, reason: FailureReason, message: String) {
        warn!("{}", message);
        m.last_failure = Some(reason);
        m.cancel_all_timers();
        self.set_state(m, ConnectionState::Failed(reason));
        self.emit(TransportEvent::Error(TransportError { reason, message }));
        self.release_link(m);
        self.set_state(m, ConnectionState::Idle);
    }

    /// Close the current link exactly once.
    fn release_link(&self, m: &mut Machine) {
        if let Some(link) = m.link.take() {
            debug!("Releasing {}", link.handle);
            self.radio.close(link.handle);
            if link.established {
                info!("Disconnected from {}", link.device);
                self.emit(TransportEvent::Disconnected);
            }
        }
    }

    fn arm_timer(&self, m: &mut Machine, link: LinkHandle, kind: TimerKind, delay: Duration) {
        m.cancel_timer(kind);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, {:?} timer not armed", kind);
            return;
        };

        let id = m.next_timer;
        m.next_timer += 1;
        let this = self.this.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(transport) = this.upgrade() {
                transport.handle_timer(link, kind, id);
            }
        });
        m.timers.insert(kind, Timer { id, task });
    }

    fn handle_timer(&self, link: LinkHandle, kind: TimerKind, id: u64) {
        let mut m = self.machine.lock();

        if m.timers.get(&kind).map(|t| t.id) != Some(id) {
            return;
        }
        m.timers.remove(&kind);
        if m.current_handle() != Some(link) {
            return;
        }

        match (kind, m.state) {
            (TimerKind::SetupTimeout, state) if state.is_setting_up() => {
                self.fail(
                    &mut m,
                    FailureReason::SetupTimeout,
                    format!("Connection setup timed out in {}", state),
                );
            }
            (TimerKind::MtuFallback, ConnectionState::NegotiatingMtu) => {
                warn!("No MTU outcome, continuing with MTU {}", m.mtu);
                m.mtu_recorded = true;
                self.begin_discovery(&mut m, link, Duration::ZERO);
            }
            (TimerKind::DiscoveryDelay, ConnectionState::DiscoveringServices) => {
                self.dispatch_discovery(&mut m, link);
            }
            (kind, state) => {
                trace!("{:?} timer fired in {}, nothing to do", kind, state);
            }
        }
    }

    /// Update the state and emit an event.
    fn set_state(&self, m: &mut Machine, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut m.state, new_state);
        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            self.emit(TransportEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for GattTransport {
    fn drop(&mut self) {
        let m = self.machine.get_mut();
        m.cancel_all_timers();
        if let Some(link) = m.link.take() {
            self.radio.close(link.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{RadioRequest, SimulatedRadio};
    use pretty_assertions::assert_eq;

    fn instant_config() -> TransportConfig {
        TransportConfig::default()
            .with_mtu_fallback_delay(Duration::ZERO)
            .with_discovery_delay(Duration::ZERO)
    }

    fn transport(config: TransportConfig) -> (Arc<SimulatedRadio>, Arc<GattTransport>) {
        let (radio, _rx) = SimulatedRadio::new();
        let radio = Arc::new(radio);
        let transport = GattTransport::with_config(radio.clone(), config);
        (radio, transport)
    }

    fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn drive_to_ready(radio: &SimulatedRadio, transport: &GattTransport) -> LinkHandle {
        transport.connect("AA:BB:CC:DD:EE:01");
        let link = radio.last_link().expect("open dispatched");
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);
        transport.handle_radio_event(
            link,
            RadioEvent::MtuChanged {
                mtu: 247,
                status: GATT_SUCCESS,
            },
        );
        transport.handle_radio_event(
            link,
            RadioEvent::ServicesDiscovered {
                status: GATT_SUCCESS,
                services: vec![GattService::mesh_proxy()],
            },
        );
        link
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Connecting.is_setting_up());
        assert!(ConnectionState::EnablingNotifications.is_setting_up());
        assert!(!ConnectionState::Idle.is_setting_up());
        assert!(!ConnectionState::Failed(FailureReason::ServiceMissing).is_setting_up());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(
            format!("{}", ConnectionState::Failed(FailureReason::LinkFailure(133))),
            "Failed(link failure (status 133))"
        );
    }

    #[tokio::test]
    async fn test_reaches_ready_exactly_once() {
        let (radio, transport) = transport(instant_config());
        let mut rx = transport.subscribe();

        let link = drive_to_ready(&radio, &transport);
        transport.handle_radio_event(
            link,
            RadioEvent::DescriptorWritten {
                descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                status: GATT_SUCCESS,
            },
        );

        let events = drain(&mut rx);
        let connected = events
            .iter()
            .filter(|e| **e == TransportEvent::Connected)
            .count();
        let ready = events
            .iter()
            .filter(|e| **e == TransportEvent::ServicesReady)
            .count();
        assert_eq!(connected, 1);
        assert_eq!(ready, 1);
        assert_eq!(transport.state(), ConnectionState::Ready);
        assert_eq!(transport.current_mtu(), 247);

        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::NegotiatingMtu,
                ConnectionState::DiscoveringServices,
                ConnectionState::EnablingNotifications,
                ConnectionState::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatches_requests_in_order() {
        let (radio, transport) = transport(instant_config());
        let link = drive_to_ready(&radio, &transport);

        assert_eq!(
            radio.requests(),
            vec![
                RadioRequest::Open {
                    link,
                    device: DeviceId::from("AA:BB:CC:DD:EE:01"),
                },
                RadioRequest::RequestMtu {
                    link,
                    mtu: TARGET_ATT_MTU,
                },
                RadioRequest::DiscoverServices { link },
                RadioRequest::EnableNotifications {
                    link,
                    characteristic: MESH_PROXY_DATA_OUT_UUID,
                    descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_send_requires_ready() {
        let (radio, transport) = transport(instant_config());
        assert!(matches!(
            transport.send(&[0x00, 0x01]),
            Err(Error::NotReady { .. })
        ));

        drive_to_ready(&radio, &transport);
        transport.send(&[0x00, 0x01, 0x02]).unwrap();
        assert_eq!(radio.written_frames(), vec![vec![0x00, 0x01, 0x02]]);

        radio.set_write_accepted(false);
        assert!(matches!(
            transport.send(&[0x03]),
            Err(Error::WriteRejected)
        ));
    }

    #[tokio::test]
    async fn test_writes_go_to_data_in() {
        let (radio, transport) = transport(instant_config());
        drive_to_ready(&radio, &transport);
        transport.send(&[0xAB]).unwrap();

        let write = radio
            .requests()
            .into_iter()
            .find(|r| matches!(r, RadioRequest::Write { .. }))
            .unwrap();
        match write {
            RadioRequest::Write { characteristic, .. } => {
                assert_eq!(characteristic, MESH_PROXY_DATA_IN_UUID)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_disconnect_twice_emits_one_disconnected() {
        let (radio, transport) = transport(instant_config());
        drive_to_ready(&radio, &transport);
        let mut rx = transport.subscribe();

        transport.disconnect();
        transport.disconnect();

        let disconnected = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == TransportEvent::Disconnected)
            .count();
        assert_eq!(disconnected, 1);
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert_eq!(radio.close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_link() {
        let (radio, transport) = transport(instant_config());
        let mut rx = transport.subscribe();

        transport.connect("AA:BB:CC:DD:EE:02");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkFailed { status: 133 });

        let events = drain(&mut rx);
        assert!(events.contains(&TransportEvent::StateChanged(ConnectionState::Failed(
            FailureReason::LinkFailure(133)
        ))));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::Error(TransportError {
                reason: FailureReason::LinkFailure(133),
                ..
            })
        )));
        assert!(!events.contains(&TransportEvent::Disconnected));
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert_eq!(
            transport.last_failure(),
            Some(FailureReason::LinkFailure(133))
        );
        assert_eq!(radio.close_count(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal() {
        let (radio, transport) = transport(instant_config());
        radio.set_deny_permission(true);
        let mut rx = transport.subscribe();

        transport.connect("AA:BB:CC:DD:EE:03");

        let error = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::Error(err) => Some(err),
                _ => None,
            })
            .unwrap();
        assert_eq!(error.reason, FailureReason::PermissionDenied);
        assert_eq!(error.class(), FailureClass::Terminal);
        assert_eq!(transport.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_proxy_service() {
        let (radio, transport) = transport(instant_config());
        transport.connect("AA:BB:CC:DD:EE:04");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);
        transport.handle_radio_event(
            link,
            RadioEvent::MtuChanged {
                mtu: 0,
                status: GATT_FAILURE,
            },
        );
        assert_eq!(transport.current_mtu(), u32::from(MIN_ATT_MTU));

        let mut rx = transport.subscribe();
        transport.handle_radio_event(
            link,
            RadioEvent::ServicesDiscovered {
                status: GATT_SUCCESS,
                services: vec![],
            },
        );

        let events = drain(&mut rx);
        assert!(events.contains(&TransportEvent::StateChanged(ConnectionState::Failed(
            FailureReason::ServiceMissing
        ))));
        // The link had come up, so its loss is reported.
        assert!(events.contains(&TransportEvent::Disconnected));
        assert_eq!(transport.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_discovery_error_status() {
        let (radio, transport) = transport(instant_config());
        transport.connect("AA:BB:CC:DD:EE:05");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);
        transport.handle_radio_event(
            link,
            RadioEvent::MtuChanged {
                mtu: 185,
                status: GATT_SUCCESS,
            },
        );
        transport.handle_radio_event(
            link,
            RadioEvent::ServicesDiscovered {
                status: 129,
                services: vec![],
            },
        );
        assert_eq!(transport.last_failure(), Some(FailureReason::LinkFailure(129)));
    }

    #[tokio::test]
    async fn test_mtu_recorded_once() {
        let (radio, transport) = transport(instant_config());
        let link = drive_to_ready(&radio, &transport);
        transport.handle_radio_event(
            link,
            RadioEvent::MtuChanged {
                mtu: 517,
                status: GATT_SUCCESS,
            },
        );
        assert_eq!(transport.current_mtu(), 247);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undispatched_mtu_falls_back_after_delay() {
        let (radio, transport) = transport(
            TransportConfig::default()
                .with_mtu_fallback_delay(Duration::from_millis(600))
                .with_discovery_delay(Duration::ZERO),
        );
        radio.set_mtu_dispatch(false);

        transport.connect("AA:BB:CC:DD:EE:06");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);
        assert_eq!(transport.state(), ConnectionState::NegotiatingMtu);

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(transport.state(), ConnectionState::DiscoveringServices);
        assert_eq!(transport.current_mtu(), u32::from(MIN_ATT_MTU));
        assert!(radio
            .requests()
            .contains(&RadioRequest::DiscoverServices { link }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_waits_for_settle_delay() {
        let (radio, transport) = transport(
            TransportConfig::default().with_discovery_delay(Duration::from_millis(300)),
        );
        transport.connect("AA:BB:CC:DD:EE:07");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);
        transport.handle_radio_event(
            link,
            RadioEvent::MtuChanged {
                mtu: 100,
                status: GATT_SUCCESS,
            },
        );
        let discover = RadioRequest::DiscoverServices { link };
        assert!(!radio.requests().contains(&discover));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(radio.requests().contains(&discover));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_fails_attempt() {
        let (radio, transport) = transport(
            instant_config().with_setup_timeout(Duration::from_secs(5)),
        );
        transport.connect("AA:BB:CC:DD:EE:08");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(transport.last_failure(), Some(FailureReason::SetupTimeout));
        assert_eq!(transport.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_cancels_setup_timeout() {
        let (radio, transport) = transport(
            instant_config().with_setup_timeout(Duration::from_secs(5)),
        );
        drive_to_ready(&radio, &transport);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.state(), ConnectionState::Ready);
        assert_eq!(transport.last_failure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_timers() {
        let (radio, transport) = transport(
            TransportConfig::default().with_mtu_fallback_delay(Duration::from_millis(600)),
        );
        radio.set_mtu_dispatch(false);
        transport.connect("AA:BB:CC:DD:EE:09");
        let link = radio.last_link().unwrap();
        transport.handle_radio_event(link, RadioEvent::LinkEstablished);

        transport.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(!radio
            .requests()
            .contains(&RadioRequest::DiscoverServices { link }));
        assert_eq!(transport.last_failure(), None);
    }

    #[tokio::test]
    async fn test_await_ack_policy() {
        let (radio, transport) = transport(
            instant_config().with_notification_policy(NotificationPolicy::AwaitAck),
        );
        let link = drive_to_ready(&radio, &transport);
        assert_eq!(transport.state(), ConnectionState::EnablingNotifications);
        assert!(transport.send(&[0x01]).is_err());

        transport.handle_radio_event(
            link,
            RadioEvent::DescriptorWritten {
                descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                status: GATT_SUCCESS,
            },
        );
        assert_eq!(transport.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_await_ack_failure() {
        let (radio, transport) = transport(
            instant_config().with_notification_policy(NotificationPolicy::AwaitAck),
        );
        let link = drive_to_ready(&radio, &transport);
        transport.handle_radio_event(
            link,
            RadioEvent::DescriptorWritten {
                descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                status: 3,
            },
        );
        assert_eq!(transport.last_failure(), Some(FailureReason::LinkFailure(3)));
        assert_eq!(transport.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_optimistic_ready_tolerates_failed_ack() {
        let (radio, transport) = transport(instant_config());
        let link = drive_to_ready(&radio, &transport);
        transport.handle_radio_event(
            link,
            RadioEvent::DescriptorWritten {
                descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                status: 3,
            },
        );
        assert_eq!(transport.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_frames_from_data_out_only() {
        let (radio, transport) = transport(instant_config());
        let link = drive_to_ready(&radio, &transport);
        let mut rx = transport.subscribe();

        transport.handle_radio_event(
            link,
            RadioEvent::Notification {
                characteristic: MESH_PROXY_DATA_OUT_UUID,
                value: vec![0x01, 0x02],
            },
        );
        transport.handle_radio_event(
            link,
            RadioEvent::Notification {
                characteristic: MESH_PROXY_DATA_IN_UUID,
                value: vec![0x03],
            },
        );

        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::FrameReceived(Bytes::from_static(&[0x01, 0x02]))]
        );
    }

    #[tokio::test]
    async fn test_link_drop_in_ready() {
        let (radio, transport) = transport(instant_config());
        let link = drive_to_ready(&radio, &transport);
        let mut rx = transport.subscribe();

        transport.handle_radio_event(link, RadioEvent::LinkDropped { status: 8 });

        let events = drain(&mut rx);
        assert!(events.contains(&TransportEvent::Disconnected));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransportEvent::Error(_))));
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(transport.send(&[0x00]).is_err());
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_link() {
        let (radio, transport) = transport(instant_config());
        let first = drive_to_ready(&radio, &transport);

        transport.connect("AA:BB:CC:DD:EE:77");
        let second = radio.last_link().unwrap();
        assert_ne!(first, second);
        assert!(radio.requests().contains(&RadioRequest::Close { link: first }));
        assert_eq!(transport.state(), ConnectionState::Connecting);

        // Late events from the released link are ignored.
        transport.handle_radio_event(first, RadioEvent::LinkDropped { status: 8 });
        assert_eq!(transport.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_same_target_is_noop() {
        let (radio, transport) = transport(instant_config());
        transport.connect("AA:BB:CC:DD:EE:10");
        transport.connect("AA:BB:CC:DD:EE:10");
        assert_eq!(radio.open_count(), 1);
        assert_eq!(radio.close_count(), 0);
    }
}
