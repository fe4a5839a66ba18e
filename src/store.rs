use crate::alert::AlertStatus;
use crate::error::PersistenceError;
use crate::ingest::ReadingStore;
use crate::reading::Reading;
use crate::scoring::Estimate;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone, Debug)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fire_readings (
                id bigserial primary key,
                node_id text not null,
                ts timestamptz not null,
                temperature double precision null,
                humidity double precision null,
                air_quality_ppm double precision null,
                flame_present boolean null,
                fire_probability double precision null,
                r_value double precision null,
                inserted_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS fire_readings_node_ts_idx
            ON fire_readings (node_id, ts DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fire_alert_status (
                node_id text primary key,
                has_fire boolean not null,
                updated_at timestamptz not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_alert_statuses(&self) -> Result<Vec<(String, AlertStatus)>> {
        let rows = sqlx::query("SELECT node_id, has_fire FROM fire_alert_status")
            .fetch_all(&self.pool)
            .await?;
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            let node_id = row.try_get::<String, _>("node_id")?;
            let status = if row.try_get::<bool, _>("has_fire")? {
                AlertStatus::Fire
            } else {
                AlertStatus::NoFire
            };
            statuses.push((node_id, status));
        }
        Ok(statuses)
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<i64, PersistenceError> {
        let row_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO fire_readings
                (node_id, ts, temperature, humidity, air_quality_ppm, flame_present)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&reading.node_id)
        .bind(reading.timestamp)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.air_quality)
        .bind(reading.flame_present)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_id)
    }

    async fn record_estimate(
        &self,
        row_id: i64,
        estimate: &Estimate,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE fire_readings
            SET fire_probability = $2, r_value = $3
            WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(estimate.probability.value())
        .bind(estimate.r_value)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::Rejected(format!(
                "reading row {row_id} not found"
            )));
        }
        Ok(())
    }

    async fn update_alert_status(
        &self,
        node_id: &str,
        has_fire: bool,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO fire_alert_status (node_id, has_fire, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (node_id)
            DO UPDATE SET has_fire = EXCLUDED.has_fire, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(node_id)
        .bind(has_fire)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
