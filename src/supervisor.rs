//! Connection supervision.
//!
//! [`ConnectionSupervisor`] owns the retry and address policy around a
//! [`GattTransport`]: bounded retries with a fixed backoff, a fast path to
//! the last proxy that worked, proxy discovery with a timeout, and a
//! human-readable status stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::scanner::ProxyCandidate;
use crate::error::{Error, FailureClass, Result};
use crate::transport::{
    ConnectionState, FailureReason, GattTransport, TransportError, TransportEvent,
};

/// Retry and discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Connection attempts per `connect` call, including the first.
    pub max_attempts: u8,
    /// Delay between a failed attempt and the next one.
    pub backoff: Duration,
    /// How long proxy discovery may take.
    pub discovery_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(2000),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Set the number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u8) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

/// Attempts used by the current connection sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u8,
    max: u8,
}

impl RetryBudget {
    /// Create an unused budget allowing `max` attempts.
    pub fn new(max: u8) -> Self {
        Self { attempts: 0, max }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Maximum number of attempts.
    pub fn max(&self) -> u8 {
        self.max
    }

    /// Forget all attempts.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Count an attempt. Returns `false` when the budget is already spent.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Check if no attempts are left.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }
}

/// Persistent storage for the last proxy that reached the ready state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyAddressStore: Send + Sync {
    /// Load the saved address.
    async fn load(&self) -> Result<Option<String>>;

    /// Save `address`, replacing any previous one.
    async fn save(&self, address: &str) -> Result<()>;
}

/// In-memory [`ProxyAddressStore`].
#[derive(Debug, Default)]
pub struct MemoryAddressStore {
    address: Mutex<Option<String>>,
}

impl MemoryAddressStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Mutex::new(Some(address.into())),
        }
    }

    /// Currently stored address.
    pub fn saved(&self) -> Option<String> {
        self.address.lock().clone()
    }
}

#[async_trait]
impl ProxyAddressStore for MemoryAddressStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.address.lock().clone())
    }

    async fn save(&self, address: &str) -> Result<()> {
        *self.address.lock() = Some(address.to_string());
        Ok(())
    }
}

/// [`ProxyAddressStore`] that keeps the address in a file.
///
/// A missing file means nothing has been saved yet.
#[derive(Debug, Clone)]
pub struct FileAddressStore {
    path: PathBuf,
}

impl FileAddressStore {
    /// Create a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, e: io::Error) -> Error {
        Error::Storage {
            reason: format!("{}: {}", self.path.display(), e),
        }
    }
}

#[async_trait]
impl ProxyAddressStore for FileAddressStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let address = contents.trim();
                Ok((!address.is_empty()).then(|| address.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.storage_error(e)),
        }
    }

    async fn save(&self, address: &str) -> Result<()> {
        debug!("Saving proxy address to {}", self.path.display());
        tokio::fs::write(&self.path, address)
            .await
            .map_err(|e| self.storage_error(e))
    }
}

/// Events published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Human-readable progress message.
    Status(String),
    /// The proxy link is ready.
    Connected {
        /// Proxy address.
        address: String,
    },
    /// A ready link went away.
    Disconnected,
    /// The connection sequence gave up.
    TerminalFailure {
        /// Proxy address.
        address: String,
        /// Failure of the last attempt.
        reason: FailureReason,
        /// Human-readable description.
        message: String,
    },
}

/// Retry and address policy on top of a [`GattTransport`].
pub struct ConnectionSupervisor {
    transport: Arc<GattTransport>,
    store: Arc<dyn ProxyAddressStore>,
    policy: RetryPolicy,
    budget: Arc<Mutex<RetryBudget>>,
    event_tx: broadcast::Sender<SupervisorEvent>,
    /// Set by whichever path reports the current link's disconnect first.
    disconnect_reported: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Create a supervisor with the default retry policy.
    pub fn new(transport: Arc<GattTransport>, store: Arc<dyn ProxyAddressStore>) -> Self {
        Self::with_policy(transport, store, RetryPolicy::default())
    }

    /// Create a supervisor with a custom retry policy.
    pub fn with_policy(
        transport: Arc<GattTransport>,
        store: Arc<dyn ProxyAddressStore>,
        policy: RetryPolicy,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let budget = Arc::new(Mutex::new(RetryBudget::new(policy.max_attempts)));

        Self {
            transport,
            store,
            policy,
            budget,
            event_tx,
            disconnect_reported: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    /// Get the supervised transport.
    pub fn transport(&self) -> &Arc<GattTransport> {
        &self.transport
    }

    /// Get the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Snapshot of the current retry budget.
    pub fn budget(&self) -> RetryBudget {
        *self.budget.lock()
    }

    /// Connect to `address`, retrying link failures within the budget.
    ///
    /// Replaces any connection sequence in progress and resets the budget.
    /// Outcomes are reported as [`SupervisorEvent`]s. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self, address: impl Into<String>) {
        let address = address.into();
        self.abort_task();
        self.budget.lock().reset();
        self.disconnect_reported.store(false, Ordering::SeqCst);

        let already_ready = self.transport.is_ready()
            && self
                .transport
                .device()
                .map(|d| d.as_str() == address)
                .unwrap_or(false);
        if already_ready {
            debug!("Already connected to {}", address);
            let _ = self.event_tx.send(SupervisorEvent::Connected { address });
            return;
        }

        let sequence = ConnectSequence {
            transport: self.transport.clone(),
            store: self.store.clone(),
            policy: self.policy.clone(),
            budget: self.budget.clone(),
            event_tx: self.event_tx.clone(),
            disconnect_reported: self.disconnect_reported.clone(),
            address,
        };
        let events = self.transport.subscribe();
        *self.task.lock() = Some(tokio::spawn(sequence.run(events)));
    }

    /// Connect straight to the saved proxy address.
    ///
    /// # Errors
    ///
    /// [`Error::NoSavedProxy`] when nothing is saved, or the store's error.
    pub async fn connect_saved(&self) -> Result<String> {
        let Some(address) = self.store.load().await? else {
            self.status("No saved proxy, scan required".to_string());
            return Err(Error::NoSavedProxy);
        };
        info!("Connecting to saved proxy {}", address);
        self.status(format!("Connecting to saved proxy {}...", address));
        self.connect(address.clone());
        Ok(address)
    }

    /// Check if a proxy address has been saved.
    pub async fn has_saved_proxy(&self) -> Result<bool> {
        Ok(self.store.load().await?.is_some())
    }

    /// Connect to the first proxy that `candidates` yields within the
    /// discovery timeout.
    ///
    /// # Errors
    ///
    /// [`Error::ProxyNotFound`] when the stream yields nothing in time.
    pub async fn connect_first_candidate<S>(&self, candidates: S) -> Result<ProxyCandidate>
    where
        S: Stream<Item = ProxyCandidate> + Send,
    {
        self.status("Searching for proxy nodes...".to_string());
        tokio::pin!(candidates);

        match tokio::time::timeout(self.policy.discovery_timeout, candidates.next()).await {
            Ok(Some(candidate)) => {
                info!("Auto-connecting to proxy {}", candidate.address);
                self.status(format!("Found proxy {}, connecting...", candidate.address));
                self.connect(candidate.address.clone());
                Ok(candidate)
            }
            Ok(None) | Err(_) => {
                warn!(
                    "No proxy found within {:?}",
                    self.policy.discovery_timeout
                );
                self.status("No proxy node found".to_string());
                Err(Error::ProxyNotFound)
            }
        }
    }

    /// Stop any connection sequence and tear the link down.
    pub fn disconnect(&self) {
        self.abort_task();
        let was_connected = self.transport.state() != ConnectionState::Idle;
        self.transport.disconnect();
        if was_connected && !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(SupervisorEvent::Disconnected);
        }
    }

    fn status(&self, message: String) {
        let _ = self.event_tx.send(SupervisorEvent::Status(message));
    }

    fn abort_task(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.abort_task();
    }
}

enum AttemptOutcome {
    Ready,
    Failed(TransportError),
    Closed,
}

/// One caller-initiated connection sequence.
struct ConnectSequence {
    transport: Arc<GattTransport>,
    store: Arc<dyn ProxyAddressStore>,
    policy: RetryPolicy,
    budget: Arc<Mutex<RetryBudget>>,
    event_tx: broadcast::Sender<SupervisorEvent>,
    disconnect_reported: Arc<AtomicBool>,
    address: String,
}

impl ConnectSequence {
    async fn run(self, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            let (attempt, max) = {
                let mut budget = self.budget.lock();
                budget.try_consume();
                (budget.attempts(), budget.max())
            };
            info!("Connecting to {} (attempt {}/{})", self.address, attempt, max);
            self.transport.connect(self.address.as_str());

            match self.watch_attempt(&mut events).await {
                AttemptOutcome::Ready => {
                    self.budget.lock().reset();
                    if let Err(e) = self.store.save(&self.address).await {
                        warn!("Failed to save proxy address: {}", e);
                    }
                    let _ = self.event_tx.send(SupervisorEvent::Connected {
                        address: self.address.clone(),
                    });
                    self.watch_ready(&mut events).await;
                    return;
                }
                AttemptOutcome::Failed(error) => {
                    let exhausted = self.budget.lock().is_exhausted();
                    if error.class() == FailureClass::Retryable && !exhausted {
                        warn!(
                            "Attempt {}/{} failed: {}, retrying in {:?}",
                            attempt, max, error.message, self.policy.backoff
                        );
                        self.status(format!(
                            "Connection failed, retrying ({}/{})...",
                            attempt, max
                        ));
                        tokio::time::sleep(self.policy.backoff).await;
                        events = events.resubscribe();
                        continue;
                    }

                    let message = if exhausted {
                        format!(
                            "Failed to connect to {} after {} attempts: {}",
                            self.address, attempt, error.reason
                        )
                    } else {
                        format!("Failed to connect to {}: {}", self.address, error.reason)
                    };
                    warn!("{}", message);
                    let _ = self.event_tx.send(SupervisorEvent::TerminalFailure {
                        address: self.address.clone(),
                        reason: error.reason,
                        message,
                    });
                    return;
                }
                AttemptOutcome::Closed => return,
            }
        }
    }

    /// Follow transport events until the attempt is ready or has failed.
    async fn watch_attempt(
        &self,
        events: &mut broadcast::Receiver<TransportEvent>,
    ) -> AttemptOutcome {
        loop {
            match events.recv().await {
                Ok(TransportEvent::StateChanged(state)) => self.report(state),
                Ok(TransportEvent::ServicesReady) => return AttemptOutcome::Ready,
                Ok(TransportEvent::Error(error)) => return AttemptOutcome::Failed(error),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("Supervisor lagged {} transport events", n);
                    if let Some(outcome) = self.settled_outcome() {
                        return outcome;
                    }
                }
                Err(RecvError::Closed) => return AttemptOutcome::Closed,
            }
        }
    }

    /// Follow a ready link until it goes away.
    async fn watch_ready(&self, events: &mut broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::StateChanged(state)) => self.report(state),
                Ok(TransportEvent::Disconnected) => {
                    self.report_disconnected();
                    return;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("Supervisor lagged {} transport events", n);
                    if !self.transport.is_ready() {
                        self.report_disconnected();
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Outcome of the attempt read from the transport itself, once it has
    /// settled. Used when missed events may have included the outcome.
    fn settled_outcome(&self) -> Option<AttemptOutcome> {
        match self.transport.state() {
            ConnectionState::Ready => Some(AttemptOutcome::Ready),
            ConnectionState::Idle => Some(match self.transport.last_failure() {
                Some(reason) => AttemptOutcome::Failed(TransportError {
                    reason,
                    message: reason.to_string(),
                }),
                None => AttemptOutcome::Closed,
            }),
            _ => None,
        }
    }

    fn report_disconnected(&self) {
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(SupervisorEvent::Disconnected);
        }
    }

    fn report(&self, state: ConnectionState) {
        let message = match state {
            ConnectionState::Idle => "Disconnected".to_string(),
            ConnectionState::Connecting => format!("Connecting to {}...", self.address),
            ConnectionState::NegotiatingMtu => "Negotiating MTU...".to_string(),
            ConnectionState::DiscoveringServices => "Discovering services...".to_string(),
            ConnectionState::EnablingNotifications => "Enabling notifications...".to_string(),
            ConnectionState::Ready => format!("Connected to {}", self.address),
            ConnectionState::Disconnecting => "Disconnecting...".to_string(),
            ConnectionState::Failed(reason) => format!("Connection failed: {}", reason),
        };
        self.status(message);
    }

    fn status(&self, message: String) {
        let _ = self.event_tx.send(SupervisorEvent::Status(message));
    }
}
