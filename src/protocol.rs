//! Boundary to the upstream WhatsApp protocol client.
//!
//! The core never speaks the wire protocol itself. It consumes a socket
//! factory, an event stream and a credential initializer through
//! [`WaProtocol`]; a real transport adapter implements the trait out of
//! tree, while [`MemoryProtocol`] backs tests and database-less development.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::codec::{to_buffer_value, WaBuffer};
use crate::session_store::SessionHandle;

/// Protocol version triple advertised during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(pub u32, pub u32, pub u32);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Signal key categories stored in the rotating-key map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKeyType {
    PreKey,
    Session,
    SenderKey,
    AppStateSyncKey,
    AppStateSyncVersion,
    SenderKeyMemory,
}

impl SignalKeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKeyType::PreKey => "pre-key",
            SignalKeyType::Session => "session",
            SignalKeyType::SenderKey => "sender-key",
            SignalKeyType::AppStateSyncKey => "app-state-sync-key",
            SignalKeyType::AppStateSyncVersion => "app-state-sync-version",
            SignalKeyType::SenderKeyMemory => "sender-key-memory",
        }
    }
}

impl fmt::Display for SignalKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKeyType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-key" => Ok(SignalKeyType::PreKey),
            "session" => Ok(SignalKeyType::Session),
            "sender-key" => Ok(SignalKeyType::SenderKey),
            "app-state-sync-key" => Ok(SignalKeyType::AppStateSyncKey),
            "app-state-sync-version" => Ok(SignalKeyType::AppStateSyncVersion),
            "sender-key-memory" => Ok(SignalKeyType::SenderKeyMemory),
            _ => Err(()),
        }
    }
}

/// Compound row key for one entry of the rotating-key map.
pub fn compound_key(kind: SignalKeyType, id: &str) -> String {
    format!("{}-{}", kind.as_str(), id)
}

/// Structured form of an `app-state-sync-key` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSyncKey {
    pub key_data: WaBuffer,
    #[serde(default)]
    pub fingerprint: Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// A decoded key-map value. `app-state-sync-key` entries are lifted into
/// their structured form; every other category stays an opaque document.
#[derive(Debug, Clone)]
pub enum SignalKey {
    Raw(Value),
    AppStateSync(AppStateSyncKey),
}

impl SignalKey {
    pub fn as_raw(&self) -> Option<&Value> {
        match self {
            SignalKey::Raw(value) => Some(value),
            SignalKey::AppStateSync(_) => None,
        }
    }
}

/// Reason attached to a `close` event by the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    RestartRequired,
    ServiceUnavailable,
}

impl DisconnectReason {
    pub fn is_logged_out(self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }

    pub fn should_reconnect(self) -> bool {
        !self.is_logged_out()
    }
}

/// Events delivered by the upstream client, in delivery order.
#[derive(Debug, Clone)]
pub enum WaEvent {
    /// A pairing challenge to be rendered and scanned.
    Qr { code: String },
    /// The connection is authenticated; `user_id` is the socket identity.
    Open { user_id: String },
    /// The credential document changed and must be persisted.
    CredsUpdate,
    Close { reason: DisconnectReason },
}

/// Fixed browser identity advertised to the upstream server.
pub const BROWSER: (&str, &str, &str) = ("WaFleet", "Chrome", "121.0.0");

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub version: ProtocolVersion,
    pub browser: (&'static str, &'static str, &'static str),
    pub sync_full_history: bool,
    pub generate_high_quality_link_preview: bool,
}

impl SocketConfig {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            browser: BROWSER,
            sync_full_history: false,
            generate_high_quality_link_preview: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to fetch protocol version: {0}")]
    VersionFetch(String),
    #[error("socket open failed: {0}")]
    Connect(String),
}

/// Control half of a live socket: valid after the event receiver is split
/// off, shared with the owning supervisor.
#[derive(Clone)]
pub struct SocketControl {
    closed: Arc<AtomicBool>,
}

impl SocketControl {
    fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Terminate the connection. Idempotent; no further events are
    /// delivered once this returns.
    pub fn end(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A freshly opened socket: the event stream plus its control half.
pub struct WaSocket {
    pub events: mpsc::Receiver<WaEvent>,
    pub control: SocketControl,
}

#[async_trait]
pub trait WaProtocol: Send + Sync {
    /// Current protocol version; consulted through the coordinator's cache.
    async fn fetch_latest_version(&self) -> Result<ProtocolVersion, ProtocolError>;

    /// Fresh credential document for a session with no stored state.
    fn init_credentials(&self) -> Value;

    /// Open a socket for the session behind `auth`. The implementation owns
    /// the returned event stream and reads/writes session state through the
    /// handle.
    async fn open_socket(
        &self,
        config: SocketConfig,
        auth: Arc<SessionHandle>,
    ) -> Result<WaSocket, ProtocolError>;
}

struct MemoryLink {
    tx: mpsc::Sender<WaEvent>,
    control: SocketControl,
}

#[derive(Default)]
struct MemoryProtocolInner {
    version: Option<ProtocolVersion>,
    fail_version_fetch: bool,
    fail_connects: bool,
    version_fetches: usize,
    links: HashMap<String, MemoryLink>,
    attempts: HashMap<String, u32>,
    attempt_log: Vec<(String, Instant)>,
}

/// In-memory [`WaProtocol`]: sockets are channels and tests inject the
/// QR/open/close events a real upstream would emit.
#[derive(Clone, Default)]
pub struct MemoryProtocol {
    inner: Arc<Mutex<MemoryProtocolInner>>,
}

impl MemoryProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_version(&self, version: ProtocolVersion) {
        self.inner.lock().version = Some(version);
    }

    pub fn fail_version_fetch(&self, fail: bool) {
        self.inner.lock().fail_version_fetch = fail;
    }

    /// When set, every `open_socket` call fails with a connect error.
    pub fn fail_connects(&self, fail: bool) {
        self.inner.lock().fail_connects = fail;
    }

    /// Number of `open_socket` calls (successful or not) for one session.
    pub fn connect_attempts(&self, name: &str) -> u32 {
        self.inner.lock().attempts.get(name).copied().unwrap_or(0)
    }

    pub fn total_connect_attempts(&self) -> usize {
        self.inner.lock().attempt_log.len()
    }

    pub fn attempt_log(&self) -> Vec<(String, Instant)> {
        self.inner.lock().attempt_log.clone()
    }

    pub fn version_fetches(&self) -> usize {
        self.inner.lock().version_fetches
    }

    pub fn has_link(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .links
            .get(name)
            .map(|l| !l.control.is_closed())
            .unwrap_or(false)
    }

    /// Deliver a synthetic event on the session's live socket. Returns
    /// false when no open socket exists for the name.
    pub async fn emit(&self, name: &str, event: WaEvent) -> bool {
        let tx = {
            let inner = self.inner.lock();
            match inner.links.get(name) {
                Some(link) if !link.control.is_closed() => link.tx.clone(),
                _ => return false,
            }
        };
        tx.send(event).await.is_ok()
    }
}

#[async_trait]
impl WaProtocol for MemoryProtocol {
    async fn fetch_latest_version(&self) -> Result<ProtocolVersion, ProtocolError> {
        let mut inner = self.inner.lock();
        inner.version_fetches += 1;
        if inner.fail_version_fetch {
            return Err(ProtocolError::VersionFetch("injected failure".into()));
        }
        Ok(inner.version.unwrap_or(ProtocolVersion(2, 3000, 0)))
    }

    fn init_credentials(&self) -> Value {
        let mut rng = rand::thread_rng();
        let mut noise_key = [0u8; 32];
        let mut identity_key = [0u8; 32];
        rng.fill_bytes(&mut noise_key);
        rng.fill_bytes(&mut identity_key);
        json!({
            "noiseKey": to_buffer_value(&noise_key),
            "signedIdentityKey": to_buffer_value(&identity_key),
            "registrationId": rng.gen_range(1u32..16_384),
            "registered": false,
        })
    }

    async fn open_socket(
        &self,
        _config: SocketConfig,
        auth: Arc<SessionHandle>,
    ) -> Result<WaSocket, ProtocolError> {
        let name = auth.name().to_string();
        let (tx, rx) = mpsc::channel(64);
        let control = SocketControl::new();
        let mut inner = self.inner.lock();
        *inner.attempts.entry(name.clone()).or_insert(0) += 1;
        inner.attempt_log.push((name.clone(), Instant::now()));
        if inner.fail_connects {
            return Err(ProtocolError::Connect("injected failure".into()));
        }
        inner.links.insert(
            name,
            MemoryLink {
                tx,
                control: control.clone(),
            },
        );
        Ok(WaSocket {
            events: rx,
            control,
        })
    }
}
