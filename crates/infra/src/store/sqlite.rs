//! SQLite-backed product table + event log.
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError | Scenario |
//! |------------|------------|----------|
//! | Database (unique violation) | `Conflict` / `Concurrency` | duplicate product id / concurrent append at the same sequence |
//! | Database (`SQLITE_BUSY`, `SQLITE_LOCKED`) | `Transient` | another writer holds the database |
//! | PoolTimedOut, PoolClosed, Io | `Transient` | backend unavailable |
//! | query exceeded the configured timeout | `Transient` | slow backend |
//! | anything else | `Backend` | schema or decode problems |
//!
//! ## Runtime
//!
//! The store traits are synchronous. The store owns a small Tokio runtime and
//! drives every query through it, so callers never need to be inside an async
//! context (and must not be: `block_on` is not reentrant).

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, info, instrument};

use provenance_core::{ActorId, EventId, LedgerTokenId, Metadata, ProductId, TxRef};
use provenance_events::{
    AnchorStatus, NewEvent, StreamTail, SupplyChainEvent, SupplyChainEventType, sequence_event,
};
use provenance_products::{Product, ProductRecord, ProductStatus};

use super::r#trait::{
    EventLogStore, ProductFilter, ProductStore, ProductWrite, ProvenanceStore, StoreError, advance_anchor,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        sku TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        category TEXT NOT NULL,
        manufacturer_id TEXT NOT NULL,
        current_custodian_id TEXT NOT NULL,
        status TEXT NOT NULL,
        ledger_token_id TEXT,
        content_metadata_ref TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS supply_chain_events (
        id TEXT PRIMARY KEY NOT NULL,
        product_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        from_actor_id TEXT,
        to_actor_id TEXT,
        location TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        ledger_anchor_status TEXT NOT NULL,
        ledger_tx_ref TEXT,
        UNIQUE (product_id, sequence)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_supply_chain_events_product_ts
        ON supply_chain_events (product_id, timestamp)
    "#,
];

/// Connection settings for [`SqliteProvenanceStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    pub url: String,
    /// Upper bound on every store call, including pool acquisition.
    pub query_timeout: Duration,
    pub max_connections: u32,
}

impl SqliteStoreOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query_timeout: Duration::from_secs(5),
            max_connections: 4,
        }
    }

    /// Private in-memory database (single connection so every call sees the same data).
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            query_timeout: Duration::from_secs(5),
            max_connections: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// SQLite-backed provenance store.
///
/// Product row and event row of a registry commit share one SQL transaction.
#[derive(Debug)]
pub struct SqliteProvenanceStore {
    pool: SqlitePool,
    runtime: tokio::runtime::Runtime,
    query_timeout: Duration,
}

impl SqliteProvenanceStore {
    /// Open (creating if missing) the database and apply the schema.
    pub fn connect(options: SqliteStoreOptions) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("provenance-sqlite")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to start store runtime: {e}")))?;

        let connect_options = SqliteConnectOptions::from_str(&options.url)
            .map_err(|e| StoreError::Backend(format!("invalid sqlite url '{}': {e}", options.url)))?
            .create_if_missing(true);

        let max_connections = if options.is_memory() { 1 } else { options.max_connections.max(1) };

        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(options.query_timeout)
                    // An in-memory database lives only as long as its connection.
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>)
                    .connect_with(connect_options),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self {
            pool,
            runtime,
            query_timeout: options.query_timeout,
        };
        store.run("migrate", store.migrate())?;

        info!(url = %options.url, max_connections, "sqlite provenance store ready");
        Ok(store)
    }

    /// Run a store future to completion on the store runtime, bounded by the query timeout.
    fn run<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        let limit = self.query_timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Transient(format!("{operation} timed out after {limit:?}"))),
            }
        })
    }

    /// Run `f` while every pooled connection is checked out, so store calls
    /// made from `f` can only time out.
    #[cfg(test)]
    pub(crate) fn while_unavailable<T>(&self, f: impl FnOnce() -> T) -> Result<T, StoreError> {
        let held = self.runtime.block_on(async {
            let mut held = Vec::new();
            for _ in 0..self.pool.options().get_max_connections() {
                held.push(self.pool.acquire().await.map_err(|e| map_sqlx_error("hold_connection", e))?);
            }
            Ok::<_, StoreError>(held)
        })?;
        let out = f();
        // Returning a connection spawns onto the pool's runtime.
        let _rt = self.runtime.enter();
        drop(held);
        Ok(out)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, write, event), fields(product_id = %event.product_id, event_type = %event.event_type), err)]
    async fn commit_async(&self, write: ProductWrite, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        if write.product().id_typed() != event.product_id {
            return Err(StoreError::Backend("product write and event target different products".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = current_version(&mut tx, write.product().id_typed()).await?;
        write.check_version(current)?;
        match (&write, current) {
            (ProductWrite::Update { product, .. }, Some(current)) => update_product(&mut tx, product, current).await?,
            (_, _) => insert_product(&mut tx, write.product()).await?,
        }

        let stored = append_in(&mut tx, event).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self, event), fields(product_id = %event.product_id, event_type = %event.event_type), err)]
    async fn append_async(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let stored = append_in(&mut tx, event).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self, tx_ref), fields(event_id = %event_id, status = %status), err)]
    async fn update_anchor_async(
        &self,
        event_id: EventId,
        status: AnchorStatus,
        tx_ref: Option<&TxRef>,
    ) -> Result<SupplyChainEvent, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(SELECT_EVENT_BY_ID)
            .bind(event_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_event", e))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        };
        let mut event = EventRow::from_row(&row)?.into_event()?;

        if advance_anchor(&mut event, status, tx_ref)? {
            sqlx::query("UPDATE supply_chain_events SET ledger_anchor_status = ?, ledger_tx_ref = ? WHERE id = ?")
                .bind(event.ledger_anchor_status.as_str())
                .bind(event.ledger_tx_ref.as_ref().map(|t| t.as_str().to_string()))
                .bind(event_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_anchor_status", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(event)
    }

    async fn set_ledger_token_async(&self, product_id: ProductId, token: &LedgerTokenId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT ledger_token_id FROM products WHERE id = ?")
            .bind(product_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_ledger_token", e))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("product {product_id}")));
        };
        let existing: Option<String> = row
            .try_get("ledger_token_id")
            .map_err(|e| map_sqlx_error("decode_ledger_token", e))?;

        match existing {
            Some(existing) if existing == token.as_str() => return Ok(false),
            Some(existing) => {
                return Err(StoreError::Conflict(format!(
                    "product {product_id} already carries ledger token {existing}"
                )));
            }
            None => {}
        }

        sqlx::query("UPDATE products SET ledger_token_id = ? WHERE id = ? AND ledger_token_id IS NULL")
            .bind(token.as_str())
            .bind(product_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_ledger_token", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    async fn get_product_async(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_PRODUCT} WHERE id = ?"))
            .bind(product_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_product", e))?;
        row.map(|r| ProductRow::from_row(&r)?.into_product()).transpose()
    }

    async fn list_products_async(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let custodian = filter.custodian.as_ref().map(|a| a.as_str().to_string());
        let manufacturer = filter.manufacturer.as_ref().map(|a| a.as_str().to_string());
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            "{SELECT_PRODUCT} \
             WHERE (? IS NULL OR current_custodian_id = ?) \
               AND (? IS NULL OR manufacturer_id = ?) \
               AND (? IS NULL OR status = ?) \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(custodian.clone())
        .bind(custodian)
        .bind(manufacturer.clone())
        .bind(manufacturer)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;

        rows.iter().map(|r| ProductRow::from_row(r)?.into_product()).collect()
    }

    async fn query_async(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE product_id = ? ORDER BY timestamp DESC, sequence DESC"
        ))
        .bind(product_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_events", e))?;

        rows.iter().map(|r| EventRow::from_row(r)?.into_event()).collect()
    }

    async fn get_event_async(&self, event_id: EventId) -> Result<Option<SupplyChainEvent>, StoreError> {
        let row = sqlx::query(SELECT_EVENT_BY_ID)
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;
        row.map(|r| EventRow::from_row(&r)?.into_event()).transpose()
    }
}

const SELECT_PRODUCT: &str = "SELECT id, name, sku, batch_id, category, manufacturer_id, current_custodian_id, \
     status, ledger_token_id, content_metadata_ref, created_at, updated_at, version FROM products";

const SELECT_EVENT: &str = "SELECT id, product_id, sequence, event_type, actor_id, from_actor_id, to_actor_id, \
     location, timestamp, metadata, ledger_anchor_status, ledger_tx_ref FROM supply_chain_events";

const SELECT_EVENT_BY_ID: &str = "SELECT id, product_id, sequence, event_type, actor_id, from_actor_id, to_actor_id, \
     location, timestamp, metadata, ledger_anchor_status, ledger_tx_ref FROM supply_chain_events WHERE id = ?";

async fn current_version(conn: &mut SqliteConnection, product_id: ProductId) -> Result<Option<u64>, StoreError> {
    let row = sqlx::query("SELECT version FROM products WHERE id = ?")
        .bind(product_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("check_product_version", e))?;

    row.map(|r| {
        r.try_get::<i64, _>("version")
            .map(|v| v as u64)
            .map_err(|e| map_sqlx_error("decode_version", e))
    })
    .transpose()
}

async fn insert_product(conn: &mut SqliteConnection, product: &Product) -> Result<(), StoreError> {
    let r = product.to_record();
    sqlx::query(
        r#"
        INSERT INTO products (
            id, name, sku, batch_id, category, manufacturer_id, current_custodian_id,
            status, ledger_token_id, content_metadata_ref, created_at, updated_at, version
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(r.id.to_string())
    .bind(r.name)
    .bind(r.sku)
    .bind(r.batch_id)
    .bind(r.category)
    .bind(r.manufacturer_id.into_inner())
    .bind(r.current_custodian_id.into_inner())
    .bind(r.status.as_str())
    .bind(r.ledger_token_id.map(LedgerTokenId::into_inner))
    .bind(r.content_metadata_ref)
    .bind(r.created_at.timestamp_micros())
    .bind(r.updated_at.timestamp_micros())
    .bind(r.version as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("product {} already exists", r.id))
        } else {
            map_sqlx_error("insert_product", e)
        }
    })?;
    Ok(())
}

/// Registry-owned columns only; the ledger token is never written here.
async fn update_product(conn: &mut SqliteConnection, product: &Product, current: u64) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE products SET status = ?, current_custodian_id = ?, updated_at = ?, version = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(product.status().as_str())
    .bind(product.current_custodian_id().as_str())
    .bind(product.updated_at().timestamp_micros())
    .bind(provenance_core::AggregateRoot::version(product) as i64)
    .bind(product.id_typed().to_string())
    .bind(current as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_product", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Concurrency(format!(
            "product {} changed concurrently",
            product.id_typed()
        )));
    }
    Ok(())
}

async fn append_in(conn: &mut SqliteConnection, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
    let row = sqlx::query(
        "SELECT sequence, timestamp FROM supply_chain_events WHERE product_id = ? ORDER BY sequence DESC LIMIT 1",
    )
    .bind(event.product_id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_stream_tail", e))?;

    let tail = match row {
        Some(row) => {
            let sequence: i64 = row.try_get("sequence").map_err(|e| map_sqlx_error("decode_tail", e))?;
            let timestamp: i64 = row.try_get("timestamp").map_err(|e| map_sqlx_error("decode_tail", e))?;
            Some(StreamTail {
                sequence: sequence as u64,
                timestamp: from_micros(timestamp)?,
            })
        }
        None => None,
    };

    let stored = sequence_event(tail, event, Utc::now())?;
    let metadata = serde_json::to_string(&stored.metadata)
        .map_err(|e| StoreError::Backend(format!("metadata serialization failed: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO supply_chain_events (
            id, product_id, sequence, event_type, actor_id, from_actor_id, to_actor_id,
            location, timestamp, metadata, ledger_anchor_status, ledger_tx_ref
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(stored.id.to_string())
    .bind(stored.product_id.to_string())
    .bind(stored.sequence as i64)
    .bind(stored.event_type.as_str())
    .bind(stored.actor_id.as_str())
    .bind(stored.from_actor_id.as_ref().map(|a| a.as_str().to_string()))
    .bind(stored.to_actor_id.as_ref().map(|a| a.as_str().to_string()))
    .bind(&stored.location)
    .bind(stored.timestamp.timestamp_micros())
    .bind(metadata)
    .bind(stored.ledger_anchor_status.as_str())
    .bind(stored.ledger_tx_ref.as_ref().map(|t| t.as_str().to_string()))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Concurrency(format!(
                "concurrent append detected: sequence {} of product {} already exists",
                stored.sequence, stored.product_id
            ))
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;

    debug!(event_id = %stored.id, sequence = stored.sequence, "event appended");
    Ok(stored)
}

impl Drop for SqliteProvenanceStore {
    fn drop(&mut self) {
        self.runtime.block_on(self.pool.close());
    }
}

impl ProductStore for SqliteProvenanceStore {
    fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        self.run("get_product", self.get_product_async(product_id))
    }

    fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        self.run("list_products", self.list_products_async(filter))
    }

    fn set_ledger_token(&self, product_id: ProductId, token: &LedgerTokenId) -> Result<bool, StoreError> {
        self.run("set_ledger_token", self.set_ledger_token_async(product_id, token))
    }
}

impl EventLogStore for SqliteProvenanceStore {
    fn append(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        self.run("append", self.append_async(event))
    }

    fn update_anchor_status(
        &self,
        event_id: EventId,
        status: AnchorStatus,
        tx_ref: Option<&TxRef>,
    ) -> Result<SupplyChainEvent, StoreError> {
        self.run("update_anchor_status", self.update_anchor_async(event_id, status, tx_ref))
    }

    fn query(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, StoreError> {
        self.run("query", self.query_async(product_id))
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<SupplyChainEvent>, StoreError> {
        self.run("get_event", self.get_event_async(event_id))
    }
}

impl ProvenanceStore for SqliteProvenanceStore {
    fn commit(&self, write: ProductWrite, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        self.run("commit", self.commit_async(write, event))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            if db_err.is_unique_violation() {
                return StoreError::Conflict(msg);
            }
            // SQLITE_BUSY (5) / SQLITE_LOCKED (6) and their extended codes.
            let busy = db_err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6));
            if busy { StoreError::Transient(msg) } else { StoreError::Backend(msg) }
        }
        sqlx::Error::PoolTimedOut => StoreError::Transient(format!("connection pool timed out in {operation}")),
        sqlx::Error::PoolClosed => StoreError::Transient(format!("connection pool closed in {operation}")),
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Backend(format!("timestamp {micros} out of range")))
}

fn decode<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T::Err: core::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Backend(format!("invalid {column} '{raw}': {e}")))
}

// SQLx row types

#[derive(Debug)]
struct ProductRow {
    id: String,
    name: String,
    sku: String,
    batch_id: String,
    category: String,
    manufacturer_id: String,
    current_custodian_id: String,
    status: String,
    ledger_token_id: Option<String>,
    content_metadata_ref: Option<String>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl ProductRow {
    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let get = |e: sqlx::Error| map_sqlx_error("decode_product_row", e);
        Ok(Self {
            id: row.try_get("id").map_err(get)?,
            name: row.try_get("name").map_err(get)?,
            sku: row.try_get("sku").map_err(get)?,
            batch_id: row.try_get("batch_id").map_err(get)?,
            category: row.try_get("category").map_err(get)?,
            manufacturer_id: row.try_get("manufacturer_id").map_err(get)?,
            current_custodian_id: row.try_get("current_custodian_id").map_err(get)?,
            status: row.try_get("status").map_err(get)?,
            ledger_token_id: row.try_get("ledger_token_id").map_err(get)?,
            content_metadata_ref: row.try_get("content_metadata_ref").map_err(get)?,
            created_at: row.try_get("created_at").map_err(get)?,
            updated_at: row.try_get("updated_at").map_err(get)?,
            version: row.try_get("version").map_err(get)?,
        })
    }

    fn into_product(self) -> Result<Product, StoreError> {
        Ok(Product::rehydrate(ProductRecord {
            id: decode::<ProductId>("product id", &self.id)?,
            name: self.name,
            sku: self.sku,
            batch_id: self.batch_id,
            category: self.category,
            manufacturer_id: ActorId::new(self.manufacturer_id),
            current_custodian_id: ActorId::new(self.current_custodian_id),
            status: decode::<ProductStatus>("status", &self.status)?,
            ledger_token_id: self.ledger_token_id.map(LedgerTokenId::new),
            content_metadata_ref: self.content_metadata_ref,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            version: self.version as u64,
        }))
    }
}

#[derive(Debug)]
struct EventRow {
    id: String,
    product_id: String,
    sequence: i64,
    event_type: String,
    actor_id: String,
    from_actor_id: Option<String>,
    to_actor_id: Option<String>,
    location: String,
    timestamp: i64,
    metadata: String,
    ledger_anchor_status: String,
    ledger_tx_ref: Option<String>,
}

impl EventRow {
    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let get = |e: sqlx::Error| map_sqlx_error("decode_event_row", e);
        Ok(Self {
            id: row.try_get("id").map_err(get)?,
            product_id: row.try_get("product_id").map_err(get)?,
            sequence: row.try_get("sequence").map_err(get)?,
            event_type: row.try_get("event_type").map_err(get)?,
            actor_id: row.try_get("actor_id").map_err(get)?,
            from_actor_id: row.try_get("from_actor_id").map_err(get)?,
            to_actor_id: row.try_get("to_actor_id").map_err(get)?,
            location: row.try_get("location").map_err(get)?,
            timestamp: row.try_get("timestamp").map_err(get)?,
            metadata: row.try_get("metadata").map_err(get)?,
            ledger_anchor_status: row.try_get("ledger_anchor_status").map_err(get)?,
            ledger_tx_ref: row.try_get("ledger_tx_ref").map_err(get)?,
        })
    }

    fn into_event(self) -> Result<SupplyChainEvent, StoreError> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| StoreError::Backend(format!("invalid metadata for event {}: {e}", self.id)))?;

        Ok(SupplyChainEvent {
            id: decode::<EventId>("event id", &self.id)?,
            product_id: decode::<ProductId>("product id", &self.product_id)?,
            sequence: self.sequence as u64,
            event_type: decode::<SupplyChainEventType>("event type", &self.event_type)?,
            actor_id: ActorId::new(self.actor_id),
            from_actor_id: self.from_actor_id.map(ActorId::new),
            to_actor_id: self.to_actor_id.map(ActorId::new),
            location: self.location,
            timestamp: from_micros(self.timestamp)?,
            metadata,
            ledger_anchor_status: decode::<AnchorStatus>("anchor status", &self.ledger_anchor_status)?,
            ledger_tx_ref: self.ledger_tx_ref.map(TxRef::new),
        })
    }
}
