//! Libsql connection pool and transaction primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libsql::{Builder, Connection as LibsqlConnection, Database, Transaction, params_from_iter};
use tokio::sync::{RwLock, Semaphore};

use crate::schema::{Row, metadata_tables};
use crate::sql::{build_insert_sql, build_select_sql, build_update_sql, libsql_value_to_db};
use crate::{Error, Result};

/// Connection behavior for the metadata database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub database_url: String,
    pub auth_token: Option<String>,
    pub max_connections: usize,
    pub timeout_ms: u64,
    pub retry_attempts: usize,
}

impl ConnectionConfig {
    pub fn in_memory() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            auth_token: None,
            max_connections: 1,
            timeout_ms: 5_000,
            retry_attempts: 0,
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self {
            database_url: path.into(),
            auth_token: None,
            max_connections: 8,
            timeout_ms: 5_000,
            retry_attempts: 0,
        }
    }

    pub fn remote(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            database_url: url.into(),
            auth_token: Some(auth_token.into()),
            max_connections: 8,
            timeout_ms: 5_000,
            retry_attempts: 2,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Handle to the metadata database.
#[derive(Clone)]
pub struct DbConnection {
    state: Arc<State>,
    config: ConnectionConfig,
}

struct State {
    pool: RwLock<Option<LibsqlPool>>,
    connected: AtomicBool,
}

impl DbConnection {
    /// Create a connection with default config (in-memory).
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    /// Create a connection with explicit config.
    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            state: Arc::new(State {
                pool: RwLock::new(None),
                connected: AtomicBool::new(false),
            }),
            config,
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        self.config.clone()
    }

    /// Open the pool, retrying with backoff per the config.
    pub async fn connect(&self) -> Result<()> {
        if self.state.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let attempts = self.config.retry_attempts + 1;
        for attempt in 0..attempts {
            match LibsqlPool::new(&self.config).await {
                Ok(pool) => {
                    *self.state.pool.write().await = Some(pool);
                    self.state.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => {
                    if attempt + 1 == attempts {
                        return Err(err);
                    }
                    let delay_ms = 100 * (1_u64 << attempt.min(6));
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(Error::Connection {
            details: format!("Failed to connect after {attempts} attempt(s): exhausted retries"),
        })
    }

    pub async fn close(&self) {
        *self.state.pool.write().await = None;
        self.state.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Create the metadata tables if they do not exist.
    pub async fn apply_schema(&self) -> Result<()> {
        let pool = self.pool().await?;
        let connection = pool.acquire().await?;
        for table in metadata_tables() {
            let sql = table.create_table_sql();
            connection
                .connection()?
                .execute(&sql, ())
                .await
                .map_err(|source| Error::Sql {
                    statement: sql.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub async fn begin_transaction(&self) -> Result<DbTransaction> {
        let pool = self.pool().await?;
        let connection = pool.acquire().await?;
        let transaction = connection
            .connection()?
            .transaction()
            .await
            .map_err(|source| Error::Libsql {
                context: "begin transaction".to_string(),
                source,
            })?;
        Ok(DbTransaction {
            connection: Some(connection),
            transaction: Some(transaction),
            active: true,
        })
    }

    async fn pool(&self) -> Result<LibsqlPool> {
        if !self.is_connected() {
            return Err(Error::Connection {
                details: "Database is not connected".to_string(),
            });
        }
        self.state
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Connection {
                details: "Connection pool is not initialized".to_string(),
            })
    }
}

impl Default for DbConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct LibsqlPool {
    inner: Arc<LibsqlPoolInner>,
}

struct LibsqlPoolInner {
    // Keep the Database alive for the lifetime of pooled connections.
    _database: Database,
    connections: std::sync::Mutex<Vec<LibsqlConnection>>,
    semaphore: Arc<Semaphore>,
}

impl LibsqlPool {
    async fn new(config: &ConnectionConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::Config {
                details: "max_connections must be greater than zero".to_string(),
            });
        }
        if config.timeout_ms == 0 {
            return Err(Error::Config {
                details: "timeout_ms must be greater than zero".to_string(),
            });
        }

        let build_future = build_database(config);
        let database = tokio::time::timeout(Duration::from_millis(config.timeout_ms), build_future)
            .await
            .map_err(|_| Error::Connection {
                details: format!(
                    "Timed out after {}ms while opening database",
                    config.timeout_ms
                ),
            })??;

        let pool_size = pool_size(config);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let connection = database.connect().map_err(|source| Error::Libsql {
                context: "connect database".to_string(),
                source,
            })?;
            connection
                .busy_timeout(Duration::from_millis(config.timeout_ms))
                .map_err(|source| Error::Libsql {
                    context: "set busy timeout".to_string(),
                    source,
                })?;
            connection
                .execute("PRAGMA foreign_keys = ON", ())
                .await
                .map_err(|source| Error::Sql {
                    statement: "PRAGMA foreign_keys = ON".to_string(),
                    source,
                })?;
            connections.push(connection);
        }

        Ok(Self {
            inner: Arc::new(LibsqlPoolInner {
                _database: database,
                connections: std::sync::Mutex::new(connections),
                semaphore: Arc::new(Semaphore::new(pool_size)),
            }),
        })
    }

    async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection {
                details: "Connection pool is closed".to_string(),
            })?;

        let mut connections = self
            .inner
            .connections
            .lock()
            .map_err(|_| Error::Connection {
                details: "Connection pool mutex is poisoned".to_string(),
            })?;
        let connection = connections.pop().ok_or_else(|| Error::Connection {
            details: "Connection pool exhausted".to_string(),
        })?;
        Ok(PooledConnection {
            inner: self.inner.clone(),
            connection: Some(connection),
            _permit: permit,
        })
    }
}

struct PooledConnection {
    inner: Arc<LibsqlPoolInner>,
    connection: Option<LibsqlConnection>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledConnection {
    fn connection(&self) -> Result<&LibsqlConnection> {
        self.connection.as_ref().ok_or_else(|| Error::Connection {
            details: "Pooled connection missing".to_string(),
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Ok(mut connections) = self.inner.connections.lock() {
                connections.push(connection);
            }
        }
    }
}

/// Transaction over the metadata tables.
///
/// Stage state, lineage edges, and action records are written through
/// one transaction so a crash never leaves a phantom output report.
pub struct DbTransaction {
    connection: Option<PooledConnection>,
    transaction: Option<Transaction>,
    active: bool,
}

impl DbTransaction {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub async fn insert_row(&mut self, table: &str, row: Row) -> Result<()> {
        let (sql, params) = build_insert_sql(table, &row)?;
        let tx = self.transaction()?;
        tx.execute(&sql, params_from_iter(params))
            .await
            .map_err(|source| Error::Sql {
                statement: sql.clone(),
                source,
            })?;
        Ok(())
    }

    pub async fn update_rows(&mut self, table: &str, filter: &Row, updates: &Row) -> Result<usize> {
        let (sql, params) = build_update_sql(table, filter, updates)?;
        let tx = self.transaction()?;
        let changed = tx
            .execute(&sql, params_from_iter(params))
            .await
            .map_err(|source| Error::Sql {
                statement: sql.clone(),
                source,
            })?;
        Ok(changed as usize)
    }

    pub async fn query_rows(&mut self, table: &str, filter: Option<&Row>) -> Result<Vec<Row>> {
        let (sql, params) = build_select_sql(table, filter);
        let tx = self.transaction()?;
        let mut rows = tx
            .query(&sql, params_from_iter(params))
            .await
            .map_err(|source| Error::Sql {
                statement: sql.clone(),
                source,
            })?;

        let mut output = Vec::new();
        while let Some(row) = rows.next().await.map_err(|source| Error::Sql {
            statement: sql.clone(),
            source,
        })? {
            output.push(libsql_row_to_row(table, &row)?);
        }
        Ok(output)
    }

    pub async fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let tx = self.transaction.take().ok_or_else(|| Error::Transaction {
            details: "Transaction is no longer active".to_string(),
        })?;
        tx.commit().await.map_err(|source| Error::Libsql {
            context: "commit transaction".to_string(),
            source,
        })?;
        self.connection.take();
        self.active = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        let tx = self.transaction.take().ok_or_else(|| Error::Transaction {
            details: "Transaction is no longer active".to_string(),
        })?;
        tx.rollback().await.map_err(|source| Error::Libsql {
            context: "rollback transaction".to_string(),
            source,
        })?;
        self.connection.take();
        self.active = false;
        Ok(())
    }

    fn transaction(&self) -> Result<&Transaction> {
        self.ensure_active()?;
        self.transaction.as_ref().ok_or_else(|| Error::Transaction {
            details: "Transaction is no longer active".to_string(),
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.active {
            return Err(Error::Transaction {
                details: "Transaction is no longer active".to_string(),
            });
        }
        Ok(())
    }
}

async fn build_database(config: &ConnectionConfig) -> Result<Database> {
    let url = config.database_url.trim();
    if url.is_empty() {
        return Err(Error::Config {
            details: "database_url must be provided".to_string(),
        });
    }

    if is_remote_url(url) {
        let token = config.auth_token.clone().ok_or_else(|| Error::Config {
            details: "auth_token is required for remote databases".to_string(),
        })?;
        let builder = Builder::new_remote(url.to_string(), token);
        builder.build().await.map_err(|source| Error::Libsql {
            context: "open remote database".to_string(),
            source,
        })
    } else {
        let path = url.strip_prefix("file:").unwrap_or(url);
        let builder = Builder::new_local(path);
        builder.build().await.map_err(|source| Error::Libsql {
            context: "open local database".to_string(),
            source,
        })
    }
}

fn is_remote_url(url: &str) -> bool {
    url.starts_with("libsql://") || url.starts_with("https://") || url.starts_with("http://")
}

fn is_in_memory_url(url: &str) -> bool {
    let url = url.trim();
    url == ":memory:" || url.starts_with("file::memory:") || url.contains("mode=memory")
}

// In-memory databases are per-connection, so the pool collapses to one.
fn pool_size(config: &ConnectionConfig) -> usize {
    if is_in_memory_url(&config.database_url) {
        1
    } else {
        config.max_connections
    }
}

fn libsql_row_to_row(table: &str, row: &libsql::Row) -> Result<Row> {
    let mut record = Row::new();
    let column_count = row.column_count();
    for idx in 0..column_count {
        let column_name = row.column_name(idx).ok_or_else(|| Error::Query {
            table: table.to_string(),
            details: format!("Missing column name for index {idx}"),
        })?;
        let value = row.get_value(idx).map_err(|source| Error::Query {
            table: table.to_string(),
            details: format!("Failed to read column '{column_name}': {source}"),
        })?;
        record.insert(column_name.to_string(), libsql_value_to_db(value));
    }
    Ok(record)
}
