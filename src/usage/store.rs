use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::{Totals, UsageRecord, UsageStats};
use crate::error::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the accountant is seeded with at startup.
#[derive(Debug, Clone, Default)]
pub struct UsageHistory {
    /// Totals over every persisted record.
    pub lifetime: UsageStats,
    /// Most recent records, oldest first.
    pub recent: Vec<UsageRecord>,
}

// 账本持久化抽象（SQLite 为默认实现）
pub trait UsageStore: Send + Sync {
    fn append<'a>(&'a self, record: &'a UsageRecord) -> BoxFuture<'a, Result<()>>;
    fn load_history<'a>(&'a self, recent: usize) -> BoxFuture<'a, Result<UsageHistory>>;
}

/// rusqlite is synchronous, so every statement runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteUsageStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    pub async fn open(database_path: &str) -> Result<Self> {
        let path = database_path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            // 确保数据库文件的目录存在
            if let Some(parent) = Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    tracing::info!("Created database directory: {}", parent.display());
                }
            }
            let conn = Connection::open(&path)?;
            Self::init(&conn)?;
            Ok(conn)
        })
        .await??;
        tracing::info!("Usage ledger initialized at: {}", database_path);

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cost REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp)",
            [],
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connection.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await?
    }

    pub async fn insert(&self, record: &UsageRecord) -> Result<()> {
        let record = record.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (
                    timestamp, provider, model, prompt_tokens,
                    completion_tokens, total_tokens, cost
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    record.timestamp.to_rfc3339(),
                    &record.provider,
                    &record.model,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_tokens,
                    record.cost,
                ),
            )?;
            Ok(())
        })
        .await
    }

    /// The last `limit` records, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<UsageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, provider, model, prompt_tokens, completion_tokens, total_tokens, cost
                 FROM (SELECT * FROM usage_records ORDER BY id DESC LIMIT ?1)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (ts, provider, model, prompt_tokens, completion_tokens, total_tokens, cost) = row?;
                let timestamp = match DateTime::parse_from_rfc3339(&ts) {
                    Ok(t) => t.with_timezone(&Utc),
                    Err(e) => {
                        tracing::warn!(timestamp = %ts, error = %e, "Skipping usage row with bad timestamp");
                        continue;
                    }
                };
                records.push(UsageRecord {
                    provider,
                    model,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    cost,
                    timestamp,
                });
            }
            Ok(records)
        })
        .await
    }

    /// Totals over the whole table, aggregated inside SQLite.
    pub async fn lifetime(&self) -> Result<UsageStats> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, model, COUNT(*), SUM(prompt_tokens), SUM(completion_tokens),
                        SUM(total_tokens), SUM(cost)
                 FROM usage_records GROUP BY provider, model",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    Totals {
                        requests: row.get::<_, i64>(2)? as u64,
                        prompt_tokens: row.get::<_, i64>(3)? as u64,
                        completion_tokens: row.get::<_, i64>(4)? as u64,
                        total_tokens: row.get::<_, i64>(5)? as u64,
                        cost: row.get::<_, f64>(6)?,
                    },
                ))
            })?;

            let mut stats = UsageStats::default();
            for row in rows {
                let (provider, model, totals) = row?;
                stats.merge_bucket(&provider, &model, &totals);
            }
            Ok(stats)
        })
        .await
    }
}

impl UsageStore for SqliteUsageStore {
    fn append<'a>(&'a self, record: &'a UsageRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.insert(record).await })
    }

    fn load_history<'a>(&'a self, recent: usize) -> BoxFuture<'a, Result<UsageHistory>> {
        Box::pin(async move {
            Ok(UsageHistory {
                lifetime: self.lifetime().await?,
                recent: self.recent(recent).await?,
            })
        })
    }
}

/// Drain the usage channel into `store` until every sender is dropped.
/// Write failures are logged and the record is dropped.
pub fn spawn_writer(
    store: Arc<dyn UsageStore>,
    mut receiver: UnboundedReceiver<UsageRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = receiver.recv().await {
            if let Err(e) = store.append(&record).await {
                tracing::error!(
                    provider = %record.provider,
                    model = %record.model,
                    error = %e,
                    "Failed to persist usage record"
                );
            }
        }
        tracing::debug!("Usage writer stopped");
    })
}
