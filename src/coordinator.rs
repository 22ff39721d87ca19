//! Fleet-wide lifecycle coordination: instance creation and deletion, the
//! supervisor map, cold-start recovery and reconnection admission control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::FleetError;
use crate::protocol::{ProtocolVersion, WaProtocol};
use crate::registry::{ConnectionStatus, InstanceRecord, InstanceRegistry, InstanceUpdate};
use crate::session_store::{SessionRepo, SessionStore};
use crate::supervisor::Supervisor;

#[derive(Default)]
struct FleetState {
    sockets: HashMap<Uuid, Arc<Supervisor>>,
    qr_codes: HashMap<Uuid, String>,
    reconnect_attempts: HashMap<Uuid, u32>,
}

struct CachedVersion {
    version: ProtocolVersion,
    fetched_at: Instant,
}

/// State shared between the coordinator handle and every supervisor.
pub struct FleetInner {
    pub(crate) config: Config,
    pub(crate) registry: Arc<dyn InstanceRegistry>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) protocol: Arc<dyn WaProtocol>,
    fleet: Mutex<FleetState>,
    reconnect_slots: Semaphore,
    active_reconnections: AtomicUsize,
    version_cache: Mutex<Option<CachedVersion>>,
}

impl FleetInner {
    pub(crate) fn set_qr(&self, id: Uuid, data_url: String) {
        self.fleet.lock().qr_codes.insert(id, data_url);
    }

    pub(crate) fn clear_qr(&self, id: Uuid) {
        self.fleet.lock().qr_codes.remove(&id);
    }

    pub(crate) fn clear_attempts(&self, id: Uuid) {
        self.fleet.lock().reconnect_attempts.remove(&id);
    }

    pub(crate) fn clear_runtime(&self, id: Uuid) {
        let mut fleet = self.fleet.lock();
        fleet.qr_codes.remove(&id);
        fleet.reconnect_attempts.remove(&id);
    }

    /// Protocol version, fetched at most once per cache window. A fetch
    /// failure propagates: a socket must not be built blind.
    pub(crate) async fn protocol_version(&self) -> Result<ProtocolVersion, FleetError> {
        if let Some(cached) = self.version_cache.lock().as_ref() {
            if cached.fetched_at.elapsed() < self.config.version_cache_ttl {
                return Ok(cached.version);
            }
        }
        let version = self.protocol.fetch_latest_version().await?;
        *self.version_cache.lock() = Some(CachedVersion {
            version,
            fetched_at: Instant::now(),
        });
        Ok(version)
    }

    /// Admit one supervisor into the reconnection path: bump its retry
    /// counter, then take a semaphore slot, sleep a random jitter and
    /// reconnect. Past the retry cap the instance is marked failed and left
    /// alone.
    pub(crate) fn request_reconnect(self: &Arc<Self>, supervisor: Arc<Supervisor>) {
        if !supervisor.begin_reconnect() {
            return;
        }
        let id = supervisor.instance_id();
        let attempts = {
            let mut fleet = self.fleet.lock();
            let counter = fleet.reconnect_attempts.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempts > self.config.max_reconnect_attempts {
            warn!(
                instance = %supervisor.instance_name(),
                attempts = attempts - 1,
                "retry cap reached; giving up on this instance"
            );
            supervisor.finish_reconnect();
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = inner
                    .registry
                    .update(id, InstanceUpdate::default().status(ConnectionStatus::Failed))
                    .await
                {
                    warn!(error = %err, "failed-status write failed");
                }
            });
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner
                .registry
                .update(
                    id,
                    InstanceUpdate::default().status(ConnectionStatus::Connecting),
                )
                .await
            {
                warn!(error = %err, "reconnect status write failed");
            }

            let Ok(permit) = inner.reconnect_slots.acquire().await else {
                supervisor.finish_reconnect();
                return;
            };
            inner.active_reconnections.fetch_add(1, Ordering::SeqCst);

            let jitter = {
                let (lo, hi) = inner.config.reconnect_jitter;
                rand::thread_rng().gen_range(lo..=hi)
            };
            tokio::time::sleep(jitter).await;

            // A delete during the wait removes the supervisor from the map;
            // in that case the slot is released without connecting.
            let still_owned = inner
                .fleet
                .lock()
                .sockets
                .get(&id)
                .map(|s| Arc::ptr_eq(s, &supervisor))
                .unwrap_or(false);
            let result = if still_owned {
                supervisor.connect().await
            } else {
                Ok(())
            };

            inner.active_reconnections.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            supervisor.finish_reconnect();

            if let Err(err) = result {
                warn!(
                    instance = %supervisor.instance_name(),
                    error = %err,
                    "reconnect attempt failed"
                );
                inner.request_reconnect(supervisor);
            }
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FleetStats {
    pub sockets: usize,
    pub active_reconnections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QrInfo {
    pub qr_code: Option<String>,
    pub connection_status: ConnectionStatus,
}

#[derive(Clone)]
pub struct FleetCoordinator {
    inner: Arc<FleetInner>,
}

impl FleetCoordinator {
    pub fn new(
        config: Config,
        registry: Arc<dyn InstanceRegistry>,
        sessions: Arc<SessionStore>,
        protocol: Arc<dyn WaProtocol>,
    ) -> Self {
        let reconnect_slots = Semaphore::new(config.reconnect_concurrency);
        Self {
            inner: Arc::new(FleetInner {
                config,
                registry,
                sessions,
                protocol,
                fleet: Mutex::new(FleetState::default()),
                reconnect_slots,
                active_reconnections: AtomicUsize::new(0),
                version_cache: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn session_repo(&self) -> Arc<dyn SessionRepo> {
        self.inner.sessions.repo()
    }

    pub fn stats(&self) -> FleetStats {
        FleetStats {
            sockets: self.inner.fleet.lock().sockets.len(),
            active_reconnections: self.inner.active_reconnections.load(Ordering::SeqCst),
        }
    }

    /// Persist a new instance and start its first connection. The map slot
    /// is reserved before the row insert so the capacity check cannot race.
    pub async fn create_instance(
        &self,
        user_id: Uuid,
        instance_name: String,
        webhook_url: String,
    ) -> Result<InstanceRecord, FleetError> {
        if let Some(existing) = self.inner.registry.get_by_name(&instance_name).await? {
            return Err(FleetError::NameTaken(existing.instance_name));
        }
        let record = InstanceRecord::new(user_id, instance_name, webhook_url);
        let supervisor = Supervisor::new(
            record.id,
            record.instance_name.clone(),
            Arc::downgrade(&self.inner),
        );
        {
            let mut fleet = self.inner.fleet.lock();
            if fleet.sockets.len() >= self.inner.config.max_instances {
                return Err(FleetError::CapacityExceeded {
                    limit: self.inner.config.max_instances,
                });
            }
            fleet.sockets.insert(record.id, Arc::clone(&supervisor));
        }
        if let Err(err) = self.inner.registry.insert(record.clone()).await {
            self.inner.fleet.lock().sockets.remove(&record.id);
            return Err(err.into());
        }
        info!(instance = %record.instance_name, id = %record.id, "instance created");
        self.spawn_connect(supervisor);
        Ok(record)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, FleetError> {
        Ok(self.inner.registry.list().await?)
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<InstanceRecord, FleetError> {
        Ok(self.inner.registry.get(id).await?)
    }

    /// Current QR for an instance; the in-memory mirror wins over the row
    /// because it is updated first.
    pub async fn get_qr(&self, id: Uuid) -> Result<QrInfo, FleetError> {
        let record = self.inner.registry.get(id).await?;
        let mirror = self.inner.fleet.lock().qr_codes.get(&id).cloned();
        Ok(QrInfo {
            qr_code: mirror.or(record.qr_code),
            connection_status: record.connection_status,
        })
    }

    /// Tear the instance's socket down and reconnect from scratch. The
    /// retry counter is deliberately left untouched.
    pub async fn restart_instance(&self, id: Uuid) -> Result<(), FleetError> {
        let record = self.inner.registry.get(id).await?;
        let supervisor = {
            let mut fleet = self.inner.fleet.lock();
            match fleet.sockets.get(&id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    if fleet.sockets.len() >= self.inner.config.max_instances {
                        return Err(FleetError::CapacityExceeded {
                            limit: self.inner.config.max_instances,
                        });
                    }
                    let adopted = Supervisor::new(
                        id,
                        record.instance_name.clone(),
                        Arc::downgrade(&self.inner),
                    );
                    fleet.sockets.insert(id, Arc::clone(&adopted));
                    adopted
                }
            }
        };
        info!(instance = %record.instance_name, "restart requested");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = supervisor.restart().await {
                warn!(
                    instance = %supervisor.instance_name(),
                    error = %err,
                    "restart failed; scheduling retry"
                );
                inner.request_reconnect(supervisor);
            }
        });
        Ok(())
    }

    /// Remove an instance entirely. The socket is stopped before the rows
    /// go away so a late creds event cannot recreate the session row.
    pub async fn delete_instance(&self, id: Uuid) -> Result<(), FleetError> {
        let record = self.inner.registry.get(id).await?;
        let supervisor = {
            let mut fleet = self.inner.fleet.lock();
            fleet.qr_codes.remove(&id);
            fleet.reconnect_attempts.remove(&id);
            fleet.sockets.remove(&id)
        };
        if let Some(supervisor) = supervisor {
            supervisor.close();
        }
        self.inner.sessions.remove(&record.instance_name).await?;
        self.inner.registry.delete(id).await?;
        info!(instance = %record.instance_name, id = %id, "instance deleted");
        Ok(())
    }

    /// Cold-start recovery: re-open every instance that was live before the
    /// process went down, in small batches so the upstream endpoint never
    /// sees the whole fleet handshake at once.
    pub async fn recover(&self) -> Result<(), FleetError> {
        let rows = self
            .inner
            .registry
            .recoverable(self.inner.config.max_instances)
            .await?;
        if rows.is_empty() {
            info!("no instances to recover");
            return Ok(());
        }
        let batch_size = self.inner.config.boot_batch_size.max(1);
        let total_batches = (rows.len() + batch_size - 1) / batch_size;
        info!(
            count = rows.len(),
            batches = total_batches,
            "recovering instances after restart"
        );
        for (index, batch) in rows.chunks(batch_size).enumerate() {
            let connects = batch.iter().filter_map(|record| {
                let supervisor = self.adopt(record)?;
                Some(async move {
                    if let Err(err) = supervisor.connect().await {
                        warn!(
                            instance = %supervisor.instance_name(),
                            error = %err,
                            "boot recovery connect failed"
                        );
                    }
                })
            });
            futures::future::join_all(connects).await;
            if index + 1 < total_batches {
                tokio::time::sleep(self.inner.config.staggered_boot_delay).await;
            }
        }
        Ok(())
    }

    /// Flush everything before exit: stop all sockets, then force the
    /// pending session writes out.
    pub async fn shutdown(&self) {
        let supervisors: Vec<_> = self.inner.fleet.lock().sockets.values().cloned().collect();
        for supervisor in &supervisors {
            supervisor.close();
        }
        self.inner.sessions.flush_all().await;
        info!(count = supervisors.len(), "fleet closed and session state flushed");
    }

    fn adopt(&self, record: &InstanceRecord) -> Option<Arc<Supervisor>> {
        let mut fleet = self.inner.fleet.lock();
        if fleet.sockets.contains_key(&record.id) {
            return None;
        }
        if fleet.sockets.len() >= self.inner.config.max_instances {
            warn!(instance = %record.instance_name, "fleet at capacity; skipping recovery");
            return None;
        }
        let supervisor = Supervisor::new(
            record.id,
            record.instance_name.clone(),
            Arc::downgrade(&self.inner),
        );
        fleet
            .sockets
            .insert(record.id, Arc::clone(&supervisor));
        Some(supervisor)
    }

    fn spawn_connect(&self, supervisor: Arc<Supervisor>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = supervisor.connect().await {
                warn!(
                    instance = %supervisor.instance_name(),
                    error = %err,
                    "connect failed; scheduling retry"
                );
                inner.request_reconnect(supervisor);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryProtocol;
    use crate::registry::MemoryRegistry;
    use crate::session_store::MemorySessionRepo;
    use std::time::Duration;

    fn coordinator(config: Config) -> (FleetCoordinator, Arc<MemoryProtocol>) {
        let protocol = Arc::new(MemoryProtocol::new());
        let sessions = Arc::new(SessionStore::new(
            MemorySessionRepo::new(),
            config.key_write_debounce,
        ));
        let coordinator = FleetCoordinator::new(
            config,
            MemoryRegistry::new(),
            sessions,
            protocol.clone(),
        );
        (coordinator, protocol)
    }

    #[tokio::test]
    async fn protocol_version_is_fetched_once_per_window() {
        let (coordinator, protocol) = coordinator(Config::default());
        protocol.set_version(ProtocolVersion(2, 3000, 42));
        let a = coordinator.inner.protocol_version().await.unwrap();
        let b = coordinator.inner.protocol_version().await.unwrap();
        assert_eq!(a, ProtocolVersion(2, 3000, 42));
        assert_eq!(b, a);
        assert_eq!(protocol.version_fetches(), 1);
    }

    #[tokio::test]
    async fn expired_version_cache_refetches() {
        let config = Config {
            version_cache_ttl: Duration::from_millis(10),
            ..Config::default()
        };
        let (coordinator, protocol) = coordinator(config);
        coordinator.inner.protocol_version().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.inner.protocol_version().await.unwrap();
        assert_eq!(protocol.version_fetches(), 2);
    }

    #[tokio::test]
    async fn version_fetch_failure_propagates() {
        let (coordinator, protocol) = coordinator(Config::default());
        protocol.fail_version_fetch(true);
        assert!(matches!(
            coordinator.inner.protocol_version().await,
            Err(FleetError::Protocol(_))
        ));
    }
}
