//! Owner of one instance's live connection across its whole life.
//!
//! Each supervisor runs a single event task per socket, so lifecycle
//! transitions for an instance are serialized: the registry can never see
//! `connected` written after the `disconnected` of the same close event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use qrcode::QrCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::FleetInner;
use crate::error::FleetError;
use crate::protocol::{DisconnectReason, SocketConfig, SocketControl, WaEvent, WaSocket};
use crate::registry::{ConnectionStatus, InstanceUpdate};
use crate::session_store::SessionHandle;

const QR_IMAGE_SIZE: u32 = 300;
const QR_QUIET_ZONE: u32 = 4;

#[derive(Debug, thiserror::Error)]
enum QrRenderError {
    #[error("qr encode failed: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("png encode failed: {0}")]
    Image(#[from] image::ImageError),
}

pub struct Supervisor {
    instance_id: Uuid,
    instance_name: String,
    fleet: Weak<FleetInner>,
    socket: Mutex<Option<SocketControl>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    auth: Mutex<Option<Arc<SessionHandle>>>,
    reconnecting: AtomicBool,
    expected_disconnect: AtomicBool,
}

impl Supervisor {
    pub(crate) fn new(instance_id: Uuid, instance_name: String, fleet: Weak<FleetInner>) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            instance_name,
            fleet,
            socket: Mutex::new(None),
            event_task: Mutex::new(None),
            auth: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Tear down any pre-existing socket, open session state and build a
    /// fresh connection, then start consuming its event stream.
    pub async fn connect(self: &Arc<Self>) -> Result<(), FleetError> {
        self.teardown();
        self.expected_disconnect.store(false, Ordering::SeqCst);
        let Some(fleet) = self.fleet.upgrade() else {
            return Ok(());
        };

        if let Err(err) = fleet
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default().status(ConnectionStatus::Connecting),
            )
            .await
        {
            warn!(instance = %self.instance_name, error = %err, "status write failed");
        }

        let auth = fleet
            .sessions
            .open(&self.instance_name, || fleet.protocol.init_credentials())
            .await?;
        *self.auth.lock() = Some(Arc::clone(&auth));

        let version = fleet.protocol_version().await?;
        let WaSocket { events, control } = fleet
            .protocol
            .open_socket(SocketConfig::new(version), auth)
            .await?;
        *self.socket.lock() = Some(control);

        let this = Arc::clone(self);
        *self.event_task.lock() = Some(tokio::spawn(this.run_events(events)));
        Ok(())
    }

    /// Tear down and reconnect from scratch; the session blob is kept.
    pub async fn restart(self: &Arc<Self>) -> Result<(), FleetError> {
        self.connect().await
    }

    /// Terminate the socket without status side effects. Used by shutdown
    /// and delete; the close event this provokes is swallowed.
    pub fn close(&self) {
        self.expected_disconnect.store(true, Ordering::SeqCst);
        self.teardown();
    }

    /// True when this supervisor was not already queued for reconnection.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    fn teardown(&self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        if let Some(control) = self.socket.lock().take() {
            control.end();
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<WaEvent>) {
        while let Some(event) = events.recv().await {
            let Some(fleet) = self.fleet.upgrade() else {
                return;
            };
            match event {
                WaEvent::Qr { code } => self.handle_qr(&fleet, &code).await,
                WaEvent::Open { user_id } => self.handle_open(&fleet, &user_id).await,
                WaEvent::CredsUpdate => self.handle_creds_update().await,
                WaEvent::Close { reason } => {
                    self.handle_close(fleet, reason).await;
                    return;
                }
            }
        }
    }

    async fn handle_qr(&self, fleet: &Arc<FleetInner>, code: &str) {
        let data_url = match qr_data_url(code) {
            Ok(url) => url,
            Err(err) => {
                warn!(instance = %self.instance_name, error = %err, "qr render failed");
                return;
            }
        };
        fleet.set_qr(self.instance_id, data_url.clone());
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(fleet.config.qr_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if let Err(err) = fleet
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default()
                    .status(ConnectionStatus::QrPending)
                    .qr(data_url, expires_at),
            )
            .await
        {
            warn!(instance = %self.instance_name, error = %err, "qr status write failed");
        }
        info!(instance = %self.instance_name, "qr code issued, waiting for scan");
    }

    async fn handle_open(&self, fleet: &Arc<FleetInner>, user_id: &str) {
        fleet.clear_qr(self.instance_id);
        fleet.clear_attempts(self.instance_id);
        let phone = phone_from_user_id(user_id);
        if let Err(err) = fleet
            .registry
            .update(
                self.instance_id,
                InstanceUpdate::default()
                    .status(ConnectionStatus::Connected)
                    .clear_qr()
                    .phone(phone.clone())
                    .last_connected_at(chrono::Utc::now()),
            )
            .await
        {
            warn!(instance = %self.instance_name, error = %err, "connected status write failed");
        }
        info!(
            instance = %self.instance_name,
            phone = phone.as_deref().unwrap_or("unknown"),
            "connection open"
        );
    }

    async fn handle_creds_update(&self) {
        let auth = self.auth.lock().clone();
        let Some(auth) = auth else { return };
        if let Err(err) = auth.save_creds().await {
            warn!(instance = %self.instance_name, error = %err, "creds persistence failed");
        }
    }

    async fn handle_close(self: &Arc<Self>, fleet: Arc<FleetInner>, reason: DisconnectReason) {
        if self.expected_disconnect.load(Ordering::SeqCst) {
            return;
        }
        if reason.is_logged_out() {
            info!(instance = %self.instance_name, "logged out; wiping session");
            if let Err(err) = fleet
                .registry
                .update(
                    self.instance_id,
                    InstanceUpdate::default()
                        .status(ConnectionStatus::Disconnected)
                        .clear_qr()
                        .phone(None),
                )
                .await
            {
                warn!(instance = %self.instance_name, error = %err, "logout status write failed");
            }
            if let Err(err) = fleet.sessions.remove(&self.instance_name).await {
                warn!(instance = %self.instance_name, error = %err, "session wipe failed");
            }
            fleet.clear_runtime(self.instance_id);
            return;
        }
        warn!(instance = %self.instance_name, ?reason, "connection closed; requesting reconnect");
        fleet.request_reconnect(Arc::clone(self));
    }
}

/// The identity's user portion precedes the device separator, e.g.
/// `"5511999000111:17@s.whatsapp.net"` → `"5511999000111"`.
fn phone_from_user_id(user_id: &str) -> Option<String> {
    let head = user_id.split('@').next().unwrap_or(user_id);
    let phone = head.split(':').next().unwrap_or(head);
    if phone.is_empty() {
        None
    } else {
        Some(phone.to_string())
    }
}

/// Render a pairing challenge into a 300 px PNG data URL.
fn qr_data_url(code: &str) -> Result<String, QrRenderError> {
    let qr = QrCode::new(code.as_bytes())?;
    let width = qr.width() as u32;
    let colors = qr.to_colors();
    let total = width + QR_QUIET_ZONE * 2;
    let img = image::GrayImage::from_fn(QR_IMAGE_SIZE, QR_IMAGE_SIZE, |x, y| {
        let mx = x * total / QR_IMAGE_SIZE;
        let my = y * total / QR_IMAGE_SIZE;
        let in_code = mx >= QR_QUIET_ZONE
            && my >= QR_QUIET_ZONE
            && mx - QR_QUIET_ZONE < width
            && my - QR_QUIET_ZONE < width;
        let dark = in_code
            && colors[((my - QR_QUIET_ZONE) * width + (mx - QR_QUIET_ZONE)) as usize]
                == qrcode::Color::Dark;
        image::Luma([if dark { 0u8 } else { 255u8 }])
    });
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64_STANDARD.encode(&png)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_is_the_user_portion_of_the_identity() {
        assert_eq!(
            phone_from_user_id("5511999000111:17@s.whatsapp.net"),
            Some("5511999000111".to_string())
        );
        assert_eq!(
            phone_from_user_id("5511999000111@s.whatsapp.net"),
            Some("5511999000111".to_string())
        );
        assert_eq!(phone_from_user_id(""), None);
    }

    #[test]
    fn qr_renders_to_a_png_data_url() {
        let url = qr_data_url("2@AbCdEfGhIjKlMnOpQrStUvWxYz0123456789").unwrap();
        let encoded = url.strip_prefix("data:image/png;base64,").unwrap();
        let png = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
