use std::env;

use async_trait::async_trait;
use chrono::Utc;
use model::{Trip, Vehicle};
use sqlx::types::Json;

use crate::{clear_trip_refs, GnssWindow, ObjectStore, Result, StoreError};

pub struct StoreConnectionInfo {
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub database: String,
}

impl StoreConnectionInfo {
    pub fn from_env() -> Option<Self> {
        let username = env::var("A2G_DATABASE_USER").ok()?;
        let password = env::var("A2G_DATABASE_PASSWORD").ok()?;
        let hostname = env::var("A2G_DATABASE_HOST").ok()?;
        let port: u16 = env::var("A2G_DATABASE_PORT").ok()?.parse().ok()?;
        let database = env::var("A2G_DATABASE_NAME").ok()?;
        Some(Self {
            username,
            password,
            hostname,
            port,
            database,
        })
    }

    fn postgres_url(self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.hostname, self.port, self.database
        )
    }
}

/// Postgres-backed store. Vehicles and trips are stored as one JSONB
/// document per row, so the entity model can evolve without schema
/// migrations; unknown fields in stored documents are ignored on load.
#[derive(Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
    window: GnssWindow,
}

fn convert_error(why: sqlx::Error) -> StoreError {
    StoreError::Other(Box::new(why))
}

fn convert_json_error(why: serde_json::Error) -> StoreError {
    StoreError::Other(Box::new(why))
}

impl PgStore {
    pub async fn connect(
        connection_info: StoreConnectionInfo,
        window: GnssWindow,
    ) -> Result<Self> {
        let url = connection_info.postgres_url();
        let pool = sqlx::postgres::PgPool::connect(&url)
            .await
            .map_err(convert_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vehicles (
                vehicle_ref TEXT PRIMARY KEY,
                document JSONB NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(convert_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trips (
                trip_id TEXT PRIMARY KEY,
                document JSONB NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(convert_error)?;

        Ok(Self { pool, window })
    }
}

#[async_trait]
impl ObjectStore for PgStore {
    async fn get_vehicles(&self) -> Result<Vec<Vehicle>> {
        let rows: Vec<Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT document FROM vehicles ORDER BY vehicle_ref")
                .fetch_all(&self.pool)
                .await
                .map_err(convert_error)?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row.0).map_err(convert_json_error))
            .collect()
    }

    async fn get_vehicle(&self, vehicle_ref: &str) -> Result<Option<Vehicle>> {
        let row: Option<Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT document FROM vehicles WHERE vehicle_ref = $1")
                .bind(vehicle_ref)
                .fetch_optional(&self.pool)
                .await
                .map_err(convert_error)?;

        row.map(|row| serde_json::from_value(row.0).map_err(convert_json_error))
            .transpose()
    }

    async fn update_vehicle(&self, mut vehicle: Vehicle) -> Result<()> {
        if let Some(activity) = vehicle.activity.as_mut() {
            self.window.trim(activity, Utc::now().timestamp());
        }

        sqlx::query(
            "INSERT INTO vehicles (vehicle_ref, document) VALUES ($1, $2)
             ON CONFLICT (vehicle_ref) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(&vehicle.vehicle_ref)
        .bind(Json(&vehicle))
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;

        Ok(())
    }

    async fn cleanup_vehicle_trip_refs(&self, vehicle_ref: &str) -> Result<()> {
        if let Some(mut vehicle) = self.get_vehicle(vehicle_ref).await? {
            clear_trip_refs(&mut vehicle);
            self.update_vehicle(vehicle).await?;
        }
        Ok(())
    }

    async fn get_trips(&self) -> Result<Vec<Trip>> {
        let rows: Vec<Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT document FROM trips ORDER BY trip_id")
                .fetch_all(&self.pool)
                .await
                .map_err(convert_error)?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row.0).map_err(convert_json_error))
            .collect()
    }

    async fn get_trip(&self, trip_id: &str) -> Result<Option<Trip>> {
        let row: Option<Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT document FROM trips WHERE trip_id = $1")
                .bind(trip_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(convert_error)?;

        row.map(|row| serde_json::from_value(row.0).map_err(convert_json_error))
            .transpose()
    }

    async fn update_trip(&self, trip: Trip) -> Result<()> {
        let trip_id = trip
            .descriptor
            .trip_id
            .clone()
            .ok_or(StoreError::IdMissing)?;

        sqlx::query(
            "INSERT INTO trips (trip_id, document) VALUES ($1, $2)
             ON CONFLICT (trip_id) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(&trip_id)
        .bind(Json(&trip))
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;

        Ok(())
    }

    async fn delete_trip(&self, trip_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM trips WHERE trip_id = $1")
            .bind(trip_id)
            .execute(&self.pool)
            .await
            .map_err(convert_error)?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
