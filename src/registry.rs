//! Durable directory of instances and their last observed connection state.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sea_query::{Expr, Iden, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::QrPending => "qr_pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl FromStr for ConnectionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "qr_pending" => Ok(ConnectionStatus::QrPending),
            "connected" => Ok(ConnectionStatus::Connected),
            "failed" => Ok(ConnectionStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One row of `whatsapp_instances`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
    pub is_connected: bool,
    pub connection_status: ConnectionStatus,
    pub qr_code: Option<String>,
    pub qr_code_expires_at: Option<DateTime<Utc>>,
    pub owner_phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(user_id: Uuid, instance_name: String, webhook_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            instance_name,
            webhook_url,
            is_connected: false,
            connection_status: ConnectionStatus::Connecting,
            qr_code: None,
            qr_code_expires_at: None,
            owner_phone_number: None,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }
}

/// Partial update of an instance row. `is_connected` is always derived from
/// the status so the two can never drift apart.
#[derive(Debug, Default, Clone)]
pub struct InstanceUpdate {
    status: Option<ConnectionStatus>,
    qr: Option<Option<(String, DateTime<Utc>)>>,
    phone: Option<Option<String>>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn qr(mut self, code: String, expires_at: DateTime<Utc>) -> Self {
        self.qr = Some(Some((code, expires_at)));
        self
    }

    pub fn clear_qr(mut self) -> Self {
        self.qr = Some(None);
        self
    }

    pub fn phone(mut self, phone: Option<String>) -> Self {
        self.phone = Some(phone);
        self
    }

    pub fn last_connected_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_connected_at = Some(at);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("instance name already in use: {0}")]
    NameTaken(String),
    #[error("user already owns an instance")]
    OwnerTaken,
    #[error("instance not found")]
    NotFound,
    #[error("registry error: {0}")]
    Store(String),
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError>;
    async fn get(&self, id: Uuid) -> Result<InstanceRecord, RegistryError>;
    async fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, RegistryError>;
    /// All instances, newest first.
    async fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError>;
    /// Apply a partial update; a missing row is not an error (the instance
    /// may have been deleted while an event was in flight).
    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<(), RegistryError>;
    async fn delete(&self, id: Uuid) -> Result<(), RegistryError>;
    /// Instances worth re-opening after a restart, oldest connection first.
    async fn recoverable(&self, limit: usize) -> Result<Vec<InstanceRecord>, RegistryError>;
}

const RECOVERABLE_STATUSES: [&str; 3] = ["connected", "connecting", "qr_pending"];

/// In-memory registry used by tests and as the fallback when no database is
/// configured.
#[derive(Default)]
pub struct MemoryRegistry {
    rows: Mutex<HashMap<Uuid, InstanceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError> {
        let mut rows = self.rows.lock();
        if rows
            .values()
            .any(|r| r.instance_name == record.instance_name)
        {
            return Err(RegistryError::NameTaken(record.instance_name));
        }
        if rows.values().any(|r| r.user_id == record.user_id) {
            return Err(RegistryError::OwnerTaken);
        }
        rows.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<InstanceRecord, RegistryError> {
        self.rows
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, RegistryError> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|r| r.instance_name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        let mut rows: Vec<_> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<(), RegistryError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(());
        };
        apply_update(row, update);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        self.rows
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound)
    }

    async fn recoverable(&self, limit: usize) -> Result<Vec<InstanceRecord>, RegistryError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|r| RECOVERABLE_STATUSES.contains(&r.connection_status.as_str()))
            .cloned()
            .collect();
        // NULL last_connected_at sorts last, matching `ORDER BY ... ASC`.
        rows.sort_by_key(|r| (r.last_connected_at.is_none(), r.last_connected_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

fn apply_update(row: &mut InstanceRecord, update: InstanceUpdate) {
    if let Some(status) = update.status {
        row.connection_status = status;
        row.is_connected = status.is_connected();
    }
    match update.qr {
        Some(Some((code, expires_at))) => {
            row.qr_code = Some(code);
            row.qr_code_expires_at = Some(expires_at);
        }
        Some(None) => {
            row.qr_code = None;
            row.qr_code_expires_at = None;
        }
        None => {}
    }
    if let Some(phone) = update.phone {
        row.owner_phone_number = phone;
    }
    if let Some(at) = update.last_connected_at {
        row.last_connected_at = Some(at);
    }
    row.updated_at = Utc::now();
}

#[derive(Iden)]
enum WhatsappInstances {
    Table,
    Id,
    UserId,
    InstanceName,
    WebhookUrl,
    IsConnected,
    ConnectionStatus,
    QrCode,
    QrCodeExpiresAt,
    OwnerPhoneNumber,
    CreatedAt,
    UpdatedAt,
    LastConnectedAt,
}

const ALL_COLUMNS: [WhatsappInstances; 12] = [
    WhatsappInstances::Id,
    WhatsappInstances::UserId,
    WhatsappInstances::InstanceName,
    WhatsappInstances::WebhookUrl,
    WhatsappInstances::IsConnected,
    WhatsappInstances::ConnectionStatus,
    WhatsappInstances::QrCode,
    WhatsappInstances::QrCodeExpiresAt,
    WhatsappInstances::OwnerPhoneNumber,
    WhatsappInstances::CreatedAt,
    WhatsappInstances::UpdatedAt,
    WhatsappInstances::LastConnectedAt,
];

pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceRegistry for PostgresRegistry {
    async fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError> {
        let name = record.instance_name.clone();
        let (sql, values) = Query::insert()
            .into_table(WhatsappInstances::Table)
            .columns(ALL_COLUMNS)
            .values_panic([
                record.id.into(),
                record.user_id.into(),
                record.instance_name.into(),
                record.webhook_url.into(),
                record.is_connected.into(),
                record.connection_status.as_str().into(),
                record.qr_code.into(),
                record.qr_code_expires_at.into(),
                record.owner_phone_number.into(),
                record.created_at.into(),
                record.updated_at.into(),
                record.last_connected_at.into(),
            ])
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, &name))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<InstanceRecord, RegistryError> {
        let (sql, values) = Query::select()
            .columns(ALL_COLUMNS)
            .from(WhatsappInstances::Table)
            .and_where(Expr::col(WhatsappInstances::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        row.map(|r| record_from_row(&r)).transpose()?.ok_or(RegistryError::NotFound)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, RegistryError> {
        let (sql, values) = Query::select()
            .columns(ALL_COLUMNS)
            .from(WhatsappInstances::Table)
            .and_where(Expr::col(WhatsappInstances::InstanceName).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        let (sql, values) = Query::select()
            .columns(ALL_COLUMNS)
            .from(WhatsappInstances::Table)
            .order_by(WhatsappInstances::CreatedAt, Order::Desc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<(), RegistryError> {
        let mut stmt = Query::update();
        stmt.table(WhatsappInstances::Table)
            .value(WhatsappInstances::UpdatedAt, Utc::now());
        if let Some(status) = update.status {
            stmt.value(WhatsappInstances::ConnectionStatus, status.as_str())
                .value(WhatsappInstances::IsConnected, status.is_connected());
        }
        match update.qr {
            Some(Some((code, expires_at))) => {
                stmt.value(WhatsappInstances::QrCode, code)
                    .value(WhatsappInstances::QrCodeExpiresAt, expires_at);
            }
            Some(None) => {
                stmt.value(WhatsappInstances::QrCode, Option::<String>::None)
                    .value(
                        WhatsappInstances::QrCodeExpiresAt,
                        Option::<DateTime<Utc>>::None,
                    );
            }
            None => {}
        }
        if let Some(phone) = update.phone {
            stmt.value(WhatsappInstances::OwnerPhoneNumber, phone);
        }
        if let Some(at) = update.last_connected_at {
            stmt.value(WhatsappInstances::LastConnectedAt, at);
        }
        stmt.and_where(Expr::col(WhatsappInstances::Id).eq(id));
        let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        let (sql, values) = Query::delete()
            .from_table(WhatsappInstances::Table)
            .and_where(Expr::col(WhatsappInstances::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound);
        }
        Ok(())
    }

    async fn recoverable(&self, limit: usize) -> Result<Vec<InstanceRecord>, RegistryError> {
        let (sql, values) = Query::select()
            .columns(ALL_COLUMNS)
            .from(WhatsappInstances::Table)
            .and_where(Expr::col(WhatsappInstances::ConnectionStatus).is_in(RECOVERABLE_STATUSES))
            .order_by(WhatsappInstances::LastConnectedAt, Order::Asc)
            .limit(limit as u64)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        rows.iter().map(record_from_row).collect()
    }
}

fn map_unique_violation(err: sqlx::Error, name: &str) -> RegistryError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            let constraint = db.constraint().unwrap_or_default();
            if constraint.contains("user_id") {
                return RegistryError::OwnerTaken;
            }
            return RegistryError::NameTaken(name.to_string());
        }
    }
    RegistryError::Store(err.to_string())
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<InstanceRecord, RegistryError> {
    let status: String = row
        .try_get("connection_status")
        .map_err(|e| RegistryError::Store(e.to_string()))?;
    let connection_status = status
        .parse::<ConnectionStatus>()
        .map_err(|_| RegistryError::Store(format!("unknown connection status: {status}")))?;
    let get = |e: sqlx::Error| RegistryError::Store(e.to_string());
    Ok(InstanceRecord {
        id: row.try_get("id").map_err(get)?,
        user_id: row.try_get("user_id").map_err(get)?,
        instance_name: row.try_get("instance_name").map_err(get)?,
        webhook_url: row.try_get("webhook_url").map_err(get)?,
        is_connected: row.try_get("is_connected").map_err(get)?,
        connection_status,
        qr_code: row.try_get("qr_code").map_err(get)?,
        qr_code_expires_at: row.try_get("qr_code_expires_at").map_err(get)?,
        owner_phone_number: row.try_get("owner_phone_number").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
        last_connected_at: row.try_get("last_connected_at").map_err(get)?,
    })
}
