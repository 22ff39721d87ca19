//! Session blob persistence: the credential document and the rotating
//! signal-key map for every instance.
//!
//! The upstream protocol rotates keys on nearly every received message, so
//! key writes are coalesced per instance: each `set` reschedules a single
//! debounce timer and the timer callback persists the latest snapshot of
//! the whole map in one row update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec::normalize_buffers;
use crate::protocol::{compound_key, AppStateSyncKey, SignalKey, SignalKeyType};

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session store error: {0}")]
    Store(String),
}

/// Listing entry for one `whatsapp_sessions` row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRowMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row-level operations on `whatsapp_sessions`, keyed by instance name.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Load `(creds, keys)` for a session; `None` when no row exists.
    async fn load(&self, name: &str) -> Result<Option<(Value, Value)>, SessionStoreError>;
    /// Write both fields in a single upsert.
    async fn upsert(&self, name: &str, creds: &Value, keys: &Value)
        -> Result<(), SessionStoreError>;
    /// Replace only the key map.
    async fn update_keys(&self, name: &str, keys: &Value) -> Result<(), SessionStoreError>;
    /// Delete the row; deleting a missing row is not an error.
    async fn delete(&self, name: &str) -> Result<(), SessionStoreError>;
    async fn exists(&self, name: &str) -> Result<bool, SessionStoreError>;
    async fn list(&self) -> Result<Vec<SessionRowMeta>, SessionStoreError>;
}

/// A batch of key mutations: `None` deletes the entry.
pub type KeyPatch = Vec<(SignalKeyType, String, Option<Value>)>;

/// Live handle on one instance's session state. The key map is owned
/// exclusively by the instance's supervisor task; the handle only
/// serializes access, it never crosses instances.
pub struct SessionHandle {
    name: String,
    repo: Arc<dyn SessionRepo>,
    debounce: Duration,
    creds: Mutex<Value>,
    keys: Mutex<HashMap<String, Value>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(
        name: String,
        repo: Arc<dyn SessionRepo>,
        debounce: Duration,
        creds: Value,
        keys: HashMap<String, Value>,
    ) -> Self {
        Self {
            name,
            repo,
            debounce,
            creds: Mutex::new(creds),
            keys: Mutex::new(keys),
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creds(&self) -> Value {
        self.creds.lock().clone()
    }

    pub fn set_creds(&self, creds: Value) {
        *self.creds.lock() = normalize_buffers(creds);
    }

    /// Look up key-map entries. Missing ids are absent from the result;
    /// `app-state-sync-key` values come back in their structured form.
    pub fn get(&self, kind: SignalKeyType, ids: &[&str]) -> HashMap<String, SignalKey> {
        let keys = self.keys.lock();
        let mut out = HashMap::new();
        for id in ids {
            let Some(value) = keys.get(&compound_key(kind, id)) else {
                continue;
            };
            let decoded = if kind == SignalKeyType::AppStateSyncKey {
                match serde_json::from_value::<AppStateSyncKey>(value.clone()) {
                    Ok(key) => SignalKey::AppStateSync(key),
                    Err(err) => {
                        warn!(session = %self.name, id = %id, error = %err,
                            "app state sync key did not parse; returning raw value");
                        SignalKey::Raw(value.clone())
                    }
                }
            } else {
                SignalKey::Raw(value.clone())
            };
            out.insert((*id).to_string(), decoded);
        }
        out
    }

    /// Apply a batch of key mutations and (re)schedule the debounced
    /// persistence of the whole map. Returns before anything is written.
    pub fn set(self: &Arc<Self>, patch: KeyPatch) {
        {
            let mut keys = self.keys.lock();
            for (kind, id, value) in patch {
                let key = compound_key(kind, &id);
                match value {
                    Some(v) => {
                        keys.insert(key, normalize_buffers(v));
                    }
                    None => {
                        keys.remove(&key);
                    }
                }
            }
        }
        let this = Arc::clone(self);
        let mut timer = self.timer.lock();
        if let Some(pending) = timer.take() {
            pending.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            let snapshot = this.keys_snapshot();
            if let Err(err) = this.repo.update_keys(&this.name, &snapshot).await {
                warn!(session = %this.name, error = %err, "debounced key write failed");
            }
        }));
    }

    /// Persist creds and keys in one row write. Does not cancel a pending
    /// debounce timer; both writers converge on the same key snapshot.
    pub async fn save_creds(&self) -> Result<(), SessionStoreError> {
        let creds = self.creds();
        let keys = self.keys_snapshot();
        self.repo.upsert(&self.name, &creds, &keys).await
    }

    /// Cancel the pending timer, if any, and issue its write now.
    pub async fn flush(&self) -> Result<(), SessionStoreError> {
        let pending = self.timer.lock().take();
        let Some(pending) = pending else {
            return Ok(());
        };
        pending.abort();
        let snapshot = self.keys_snapshot();
        self.repo.update_keys(&self.name, &snapshot).await
    }

    fn cancel_pending(&self) {
        if let Some(pending) = self.timer.lock().take() {
            pending.abort();
        }
    }

    fn keys_snapshot(&self) -> Value {
        let keys = self.keys.lock();
        Value::Object(keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
    }
}

/// Factory and flush point for [`SessionHandle`]s.
pub struct SessionStore {
    repo: Arc<dyn SessionRepo>,
    debounce: Duration,
    handles: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new(repo: Arc<dyn SessionRepo>, debounce: Duration) -> Self {
        Self {
            repo,
            debounce,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> Arc<dyn SessionRepo> {
        Arc::clone(&self.repo)
    }

    /// Open the handle for `name`, loading stored state or initializing a
    /// fresh credential document via `fresh_creds`.
    pub async fn open(
        &self,
        name: &str,
        fresh_creds: impl FnOnce() -> Value,
    ) -> Result<Arc<SessionHandle>, SessionStoreError> {
        if let Some(handle) = self.handles.lock().get(name) {
            return Ok(Arc::clone(handle));
        }
        let stored = self.repo.load(name).await?;
        let (creds, keys) = match stored {
            Some((creds, keys)) => {
                let creds = if creds.is_null() {
                    normalize_buffers(fresh_creds())
                } else {
                    normalize_buffers(creds)
                };
                let keys = match keys {
                    Value::Object(map) => map
                        .into_iter()
                        .map(|(k, v)| (k, normalize_buffers(v)))
                        .collect(),
                    _ => HashMap::new(),
                };
                (creds, keys)
            }
            None => (normalize_buffers(fresh_creds()), HashMap::new()),
        };
        let handle = Arc::new(SessionHandle::new(
            name.to_string(),
            Arc::clone(&self.repo),
            self.debounce,
            creds,
            keys,
        ));
        // A concurrent open may have raced us; keep whichever landed first.
        let mut handles = self.handles.lock();
        Ok(Arc::clone(
            handles
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&handle)),
        ))
    }

    /// Drop the session: cancel pending writes and delete the row. Safe to
    /// call when neither a handle nor a row exists.
    pub async fn remove(&self, name: &str) -> Result<(), SessionStoreError> {
        if let Some(handle) = self.handles.lock().remove(name) {
            handle.cancel_pending();
        }
        self.repo.delete(name).await
    }

    /// Cancel every pending timer and issue the outstanding writes; used on
    /// shutdown. Failures are logged, not propagated.
    pub async fn flush_all(&self) {
        let handles: Vec<_> = self.handles.lock().values().cloned().collect();
        let flushes = handles.into_iter().map(|handle| async move {
            if let Err(err) = handle.flush().await {
                warn!(session = %handle.name(), error = %err, "flush on shutdown failed");
            }
        });
        futures::future::join_all(flushes).await;
    }
}

#[derive(Default)]
struct MemorySessionRow {
    creds: Value,
    keys: Value,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory session rows; counts key updates so tests can assert
/// coalescing behavior.
#[derive(Default)]
pub struct MemorySessionRepo {
    rows: Mutex<HashMap<String, MemorySessionRow>>,
    keys_updates: Mutex<usize>,
    fail_writes: Mutex<bool>,
}

impl MemorySessionRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total number of key-map writes observed (debounced or via upsert).
    pub fn keys_updates(&self) -> usize {
        *self.keys_updates.lock()
    }

    pub fn stored_keys(&self, name: &str) -> Option<Value> {
        self.rows.lock().get(name).map(|r| r.keys.clone())
    }

    pub fn stored_creds(&self, name: &str) -> Option<Value> {
        self.rows.lock().get(name).map(|r| r.creds.clone())
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    fn check_writable(&self) -> Result<(), SessionStoreError> {
        if *self.fail_writes.lock() {
            return Err(SessionStoreError::Store("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for MemorySessionRepo {
    async fn load(&self, name: &str) -> Result<Option<(Value, Value)>, SessionStoreError> {
        Ok(self
            .rows
            .lock()
            .get(name)
            .map(|r| (r.creds.clone(), r.keys.clone())))
    }

    async fn upsert(
        &self,
        name: &str,
        creds: &Value,
        keys: &Value,
    ) -> Result<(), SessionStoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let row = rows.entry(name.to_string()).or_default();
        row.creds = creds.clone();
        row.keys = keys.clone();
        row.created_at.get_or_insert(now);
        row.updated_at = Some(now);
        *self.keys_updates.lock() += 1;
        Ok(())
    }

    async fn update_keys(&self, name: &str, keys: &Value) -> Result<(), SessionStoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let row = rows.entry(name.to_string()).or_default();
        row.keys = keys.clone();
        row.created_at.get_or_insert(now);
        row.updated_at = Some(now);
        *self.keys_updates.lock() += 1;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SessionStoreError> {
        self.check_writable()?;
        self.rows.lock().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, SessionStoreError> {
        Ok(self.rows.lock().contains_key(name))
    }

    async fn list(&self) -> Result<Vec<SessionRowMeta>, SessionStoreError> {
        let rows = self.rows.lock();
        let mut out: Vec<_> = rows
            .iter()
            .map(|(id, row)| SessionRowMeta {
                id: id.clone(),
                created_at: row.created_at.unwrap_or_else(Utc::now),
                updated_at: row.updated_at.unwrap_or_else(Utc::now),
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

#[derive(Iden)]
enum WhatsappSessions {
    Table,
    Id,
    Creds,
    Keys,
    CreatedAt,
    UpdatedAt,
}

pub struct PostgresSessionRepo {
    pool: PgPool,
}

impl PostgresSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepo for PostgresSessionRepo {
    async fn load(&self, name: &str) -> Result<Option<(Value, Value)>, SessionStoreError> {
        let (sql, values) = Query::select()
            .columns([WhatsappSessions::Creds, WhatsappSessions::Keys])
            .from(WhatsappSessions::Table)
            .and_where(Expr::col(WhatsappSessions::Id).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        row.map(|r| {
            let creds: Option<Value> = r
                .try_get("creds")
                .map_err(|e| SessionStoreError::Store(e.to_string()))?;
            let keys: Value = r
                .try_get("keys")
                .map_err(|e| SessionStoreError::Store(e.to_string()))?;
            Ok((creds.unwrap_or(Value::Null), keys))
        })
        .transpose()
    }

    async fn upsert(
        &self,
        name: &str,
        creds: &Value,
        keys: &Value,
    ) -> Result<(), SessionStoreError> {
        let now = Utc::now();
        let (sql, values) = Query::insert()
            .into_table(WhatsappSessions::Table)
            .columns([
                WhatsappSessions::Id,
                WhatsappSessions::Creds,
                WhatsappSessions::Keys,
                WhatsappSessions::CreatedAt,
                WhatsappSessions::UpdatedAt,
            ])
            .values_panic([
                name.into(),
                creds.clone().into(),
                keys.clone().into(),
                now.into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::column(WhatsappSessions::Id)
                    .update_columns([
                        WhatsappSessions::Creds,
                        WhatsappSessions::Keys,
                        WhatsappSessions::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn update_keys(&self, name: &str, keys: &Value) -> Result<(), SessionStoreError> {
        let now = Utc::now();
        let (sql, values) = Query::insert()
            .into_table(WhatsappSessions::Table)
            .columns([
                WhatsappSessions::Id,
                WhatsappSessions::Keys,
                WhatsappSessions::CreatedAt,
                WhatsappSessions::UpdatedAt,
            ])
            .values_panic([name.into(), keys.clone().into(), now.into(), now.into()])
            .on_conflict(
                OnConflict::column(WhatsappSessions::Id)
                    .update_columns([WhatsappSessions::Keys, WhatsappSessions::UpdatedAt])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SessionStoreError> {
        let (sql, values) = Query::delete()
            .from_table(WhatsappSessions::Table)
            .and_where(Expr::col(WhatsappSessions::Id).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, SessionStoreError> {
        let (sql, values) = Query::select()
            .column(WhatsappSessions::Id)
            .from(WhatsappSessions::Table)
            .and_where(Expr::col(WhatsappSessions::Id).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn list(&self) -> Result<Vec<SessionRowMeta>, SessionStoreError> {
        let (sql, values) = Query::select()
            .columns([
                WhatsappSessions::Id,
                WhatsappSessions::CreatedAt,
                WhatsappSessions::UpdatedAt,
            ])
            .from(WhatsappSessions::Table)
            .order_by(WhatsappSessions::CreatedAt, Order::Desc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Store(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                Ok(SessionRowMeta {
                    id: r
                        .try_get("id")
                        .map_err(|e| SessionStoreError::Store(e.to_string()))?,
                    created_at: r
                        .try_get("created_at")
                        .map_err(|e| SessionStoreError::Store(e.to_string()))?,
                    updated_at: r
                        .try_get("updated_at")
                        .map_err(|e| SessionStoreError::Store(e.to_string()))?,
                })
            })
            .collect()
    }
}
