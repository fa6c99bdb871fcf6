//! Comp persistence and inventory lookup.
//!
//! Both seams are traits so the refresh job can run against Postgres in
//! production and against the in-memory stores in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use compcheck_core::{CompRecord, InventoryVehicle};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("record for inventory {found} passed to replace for inventory {expected}")]
    InventoryMismatch { expected: i64, found: i64 },
}

fn check_inventory(inventory_id: i64, records: &[CompRecord]) -> Result<(), StoreError> {
    match records.iter().find(|r| r.inventory_id != inventory_id) {
        Some(stray) => Err(StoreError::InventoryMismatch {
            expected: inventory_id,
            found: stray.inventory_id,
        }),
        None => Ok(()),
    }
}

/// Row store for comps keyed by inventory id.
#[async_trait]
pub trait CompStore: Send + Sync {
    /// Deletes every record for `inventory_id` and inserts `records` as one
    /// atomic unit: readers see either the old set or the new set.
    async fn replace_comps(&self, inventory_id: i64, records: &[CompRecord]) -> Result<usize, StoreError>;

    async fn comps_for(&self, inventory_id: i64) -> Result<Vec<CompRecord>, StoreError>;
}

#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_vehicles(&self) -> Result<Vec<InventoryVehicle>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCompStore {
    rows: RwLock<HashMap<i64, Vec<CompRecord>>>,
}

impl MemoryCompStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, inventory_id: i64, records: Vec<CompRecord>) {
        self.rows.write().await.insert(inventory_id, records);
    }
}

#[async_trait]
impl CompStore for MemoryCompStore {
    async fn replace_comps(&self, inventory_id: i64, records: &[CompRecord]) -> Result<usize, StoreError> {
        check_inventory(inventory_id, records)?;
        let mut rows = self.rows.write().await;
        rows.insert(inventory_id, records.to_vec());
        Ok(records.len())
    }

    async fn comps_for(&self, inventory_id: i64) -> Result<Vec<CompRecord>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .get(&inventory_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    vehicles: Vec<InventoryVehicle>,
}

impl MemoryInventory {
    pub fn new(vehicles: Vec<InventoryVehicle>) -> Self {
        Self { vehicles }
    }
}

#[async_trait]
impl InventorySource for MemoryInventory {
    async fn list_vehicles(&self) -> Result<Vec<InventoryVehicle>, StoreError> {
        Ok(self.vehicles.clone())
    }
}

pub async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    info!("applying migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgCompStore {
    pool: PgPool,
}

impl PgCompStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn comp_from_row(row: &PgRow) -> Result<CompRecord, sqlx::Error> {
    Ok(CompRecord {
        inventory_id: row.try_get("inventory_id")?,
        source: row.try_get("source")?,
        year: row.try_get("year")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        trim: row.try_get("trim")?,
        mileage: row.try_get("mileage")?,
        price: row.try_get("price")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CompStore for PgCompStore {
    async fn replace_comps(&self, inventory_id: i64, records: &[CompRecord]) -> Result<usize, StoreError> {
        check_inventory(inventory_id, records)?;
        // Dropping the transaction without commit rolls the delete back.
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM market_comps WHERE inventory_id = $1")
            .bind(inventory_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO market_comps
                    (inventory_id, source, year, make, model, trim, mileage, price, url, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(inventory_id)
            .bind(&record.source)
            .bind(&record.year)
            .bind(&record.make)
            .bind(&record.model)
            .bind(&record.trim)
            .bind(&record.mileage)
            .bind(record.price)
            .bind(&record.url)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(inventory_id, deleted, inserted = records.len(), "replaced comps");
        Ok(records.len())
    }

    async fn comps_for(&self, inventory_id: i64) -> Result<Vec<CompRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT inventory_id, source, year, make, model, trim, mileage, price, url, created_at
              FROM market_comps
             WHERE inventory_id = $1
             ORDER BY price ASC, id ASC
            "#,
        )
        .bind(inventory_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(comp_from_row(row)?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventorySource for PgInventory {
    async fn list_vehicles(&self) -> Result<Vec<InventoryVehicle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id::bigint AS id,
                   year::int AS year,
                   make,
                   model,
                   trim,
                   zipcode,
                   price::bigint AS price
              FROM ai_inventory_context
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(InventoryVehicle {
                id: row.try_get("id")?,
                year: row.try_get("year")?,
                make: row.try_get("make")?,
                model: row.try_get("model")?,
                trim: row.try_get("trim")?,
                zipcode: row.try_get("zipcode")?,
                price: row.try_get("price")?,
            });
        }
        Ok(out)
    }
}
