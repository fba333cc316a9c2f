//! In-process radio stack.
//!
//! [`SimulatedRadio`] records every request the transport dispatches and can
//! either answer them like a healthy mesh proxy node (auto-respond mode) or
//! leave the outcomes to the caller, which injects events by hand. Used for
//! tests and for running the demo without hardware.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::radio::*;
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// A request seen by the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioRequest {
    /// `open` was called.
    Open {
        /// Link handle.
        link: LinkHandle,
        /// Target device.
        device: DeviceId,
    },
    /// `request_mtu` was called.
    RequestMtu {
        /// Link handle.
        link: LinkHandle,
        /// Requested MTU.
        mtu: u16,
    },
    /// `discover_services` was called.
    DiscoverServices {
        /// Link handle.
        link: LinkHandle,
    },
    /// `enable_notifications` was called.
    EnableNotifications {
        /// Link handle.
        link: LinkHandle,
        /// Characteristic to enable.
        characteristic: Uuid,
        /// Descriptor written.
        descriptor: Uuid,
    },
    /// `write_without_response` was called.
    Write {
        /// Link handle.
        link: LinkHandle,
        /// Target characteristic.
        characteristic: Uuid,
        /// Written bytes.
        data: Vec<u8>,
    },
    /// `close` was called.
    Close {
        /// Link handle.
        link: LinkHandle,
    },
}

/// A scriptable [`RadioStack`].
pub struct SimulatedRadio {
    events: mpsc::UnboundedSender<RadioCallback>,
    requests: Mutex<Vec<RadioRequest>>,
    auto_respond: AtomicBool,
    deny_permission: AtomicBool,
    mtu_dispatch: AtomicBool,
    write_accepted: AtomicBool,
    link_failure: Mutex<Option<i32>>,
    peer_mtu: Mutex<u16>,
    services: Mutex<Vec<GattService>>,
}

impl SimulatedRadio {
    /// Create a simulated radio in manual mode.
    ///
    /// The returned receiver carries injected and auto-generated events;
    /// hand it to [`crate::GattTransport::attach`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RadioCallback>) {
        let (events, rx) = mpsc::unbounded_channel();
        let radio = Self {
            events,
            requests: Mutex::new(Vec::new()),
            auto_respond: AtomicBool::new(false),
            deny_permission: AtomicBool::new(false),
            mtu_dispatch: AtomicBool::new(true),
            write_accepted: AtomicBool::new(true),
            link_failure: Mutex::new(None),
            peer_mtu: Mutex::new(TARGET_ATT_MTU),
            services: Mutex::new(vec![GattService::mesh_proxy()]),
        };
        (radio, rx)
    }

    /// Answer every request like a healthy proxy node.
    pub fn set_auto_respond(&self, enabled: bool) {
        self.auto_respond.store(enabled, Ordering::SeqCst);
    }

    /// Make `open` fail with [`Error::PermissionDenied`].
    pub fn set_deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    /// Control whether MTU requests can be dispatched.
    pub fn set_mtu_dispatch(&self, dispatch: bool) {
        self.mtu_dispatch.store(dispatch, Ordering::SeqCst);
    }

    /// Control whether writes are accepted.
    pub fn set_write_accepted(&self, accepted: bool) {
        self.write_accepted.store(accepted, Ordering::SeqCst);
    }

    /// In auto-respond mode, answer `open` with `LinkFailed { status }`
    /// instead of bringing the link up.
    pub fn set_link_failure(&self, status: Option<i32>) {
        *self.link_failure.lock() = status;
    }

    /// MTU the simulated peer agrees to.
    pub fn set_peer_mtu(&self, mtu: u16) {
        *self.peer_mtu.lock() = mtu;
    }

    /// Services reported by discovery in auto-respond mode.
    pub fn set_services(&self, services: Vec<GattService>) {
        *self.services.lock() = services;
    }

    /// Queue an event for delivery through the event channel.
    pub fn inject(&self, link: LinkHandle, event: RadioEvent) {
        trace!("Injecting {:?} for {}", event, link);
        let _ = self.events.send(RadioCallback { link, event });
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<RadioRequest> {
        self.requests.lock().clone()
    }

    /// Handle of the most recent `open` request.
    pub fn last_link(&self) -> Option<LinkHandle> {
        self.requests.lock().iter().rev().find_map(|r| match r {
            RadioRequest::Open { link, .. } => Some(*link),
            _ => None,
        })
    }

    /// Number of `open` requests seen so far.
    pub fn open_count(&self) -> usize {
        self.count(|r| matches!(r, RadioRequest::Open { .. }))
    }

    /// Number of `close` requests seen so far.
    pub fn close_count(&self) -> usize {
        self.count(|r| matches!(r, RadioRequest::Close { .. }))
    }

    /// Bytes of every write, in order.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                RadioRequest::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&RadioRequest) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| predicate(r)).count()
    }

    fn record(&self, request: RadioRequest) {
        trace!("Radio request: {:?}", request);
        self.requests.lock().push(request);
    }

    fn auto(&self) -> bool {
        self.auto_respond.load(Ordering::SeqCst)
    }
}

impl RadioStack for SimulatedRadio {
    fn open(&self, link: LinkHandle, device: &DeviceId) -> Result<()> {
        self.record(RadioRequest::Open {
            link,
            device: device.clone(),
        });
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied);
        }
        if self.auto() {
            match *self.link_failure.lock() {
                Some(status) => self.inject(link, RadioEvent::LinkFailed { status }),
                None => self.inject(link, RadioEvent::LinkEstablished),
            }
        }
        Ok(())
    }

    fn request_mtu(&self, link: LinkHandle, mtu: u16) -> bool {
        self.record(RadioRequest::RequestMtu { link, mtu });
        if !self.mtu_dispatch.load(Ordering::SeqCst) {
            return false;
        }
        if self.auto() {
            let agreed = mtu.min(*self.peer_mtu.lock());
            self.inject(
                link,
                RadioEvent::MtuChanged {
                    mtu: agreed,
                    status: GATT_SUCCESS,
                },
            );
        }
        true
    }

    fn discover_services(&self, link: LinkHandle) -> bool {
        self.record(RadioRequest::DiscoverServices { link });
        if self.auto() {
            let services = self.services.lock().clone();
            self.inject(
                link,
                RadioEvent::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    services,
                },
            );
        }
        true
    }

    fn enable_notifications(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> bool {
        self.record(RadioRequest::EnableNotifications {
            link,
            characteristic,
            descriptor,
        });
        if self.auto() {
            self.inject(
                link,
                RadioEvent::DescriptorWritten {
                    descriptor,
                    status: GATT_SUCCESS,
                },
            );
        }
        true
    }

    fn write_without_response(&self, link: LinkHandle, characteristic: Uuid, data: &[u8]) -> bool {
        self.record(RadioRequest::Write {
            link,
            characteristic,
            data: data.to_vec(),
        });
        self.write_accepted.load(Ordering::SeqCst)
    }

    fn close(&self, link: LinkHandle) {
        self.record(RadioRequest::Close { link });
    }
}
