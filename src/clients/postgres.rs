use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use crate::{
    clients::store::{FailureStore, StoreResult},
    models::dlq::{FailedEvent, FailedEventStatus, StoredFailedEvent},
};

const SCHEMA: &str = include_str!("../../migrations/001_create_dlq_events.sql");

/// PostgreSQL-backed failure store over the `dlq_events` table.
pub struct PostgresFailureStore {
    client: Client,
}

impl PostgresFailureStore {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        info!("PostgreSQL connection established");

        let store = Self { client };
        store.ensure_schema().await?;

        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to create dlq_events schema: {}", e))?;

        debug!("dlq_events schema ensured");
        Ok(())
    }
}

fn stored_from_row(row: &Row) -> StoreResult<StoredFailedEvent> {
    let payload: JsonValue = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let stored_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(StoredFailedEvent {
        event: serde_json::from_value(payload)?,
        status: FailedEventStatus::from_string(&status),
        resolution_notes: row.try_get("resolution_notes")?,
        stored_at,
        updated_at,
    })
}

#[async_trait]
impl FailureStore for PostgresFailureStore {
    async fn save(&self, event: &FailedEvent) -> StoreResult<()> {
        let payload = serde_json::to_value(event)?;
        let retry_count = i32::try_from(event.retry_count).unwrap_or(i32::MAX);

        self.client
            .execute(
                r#"
                INSERT INTO dlq_events (
                    event_id,
                    original_subject,
                    event_type,
                    error_type,
                    error_message,
                    retry_count,
                    payload,
                    dlq_timestamp
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (event_id) DO UPDATE SET
                    original_subject = EXCLUDED.original_subject,
                    event_type = EXCLUDED.event_type,
                    error_type = EXCLUDED.error_type,
                    error_message = EXCLUDED.error_message,
                    retry_count = EXCLUDED.retry_count,
                    payload = EXCLUDED.payload,
                    dlq_timestamp = EXCLUDED.dlq_timestamp,
                    status = 'pending',
                    updated_at = now()
                "#,
                &[
                    &event.event_id,
                    &event.original_subject,
                    &event.event_type,
                    &event.error_type,
                    &event.error_message,
                    &retry_count,
                    &payload,
                    &event.dlq_timestamp,
                ],
            )
            .await?;

        debug!(event_id = %event.event_id, "Failed event stored");
        Ok(())
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<StoredFailedEvent>> {
        let row = self
            .client
            .query_opt(
                r#"
                SELECT payload, status, resolution_notes, created_at, updated_at
                FROM dlq_events
                WHERE event_id = $1
                "#,
                &[&event_id],
            )
            .await?;

        row.as_ref().map(stored_from_row).transpose()
    }

    async fn list(
        &self,
        status: Option<FailedEventStatus>,
        limit: usize,
    ) -> StoreResult<Vec<StoredFailedEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let status = status.map(|s| s.as_str().to_string());

        let rows = self
            .client
            .query(
                r#"
                SELECT payload, status, resolution_notes, created_at, updated_at
                FROM dlq_events
                WHERE ($1::TEXT IS NULL OR status = $1)
                ORDER BY dlq_timestamp ASC
                LIMIT $2
                "#,
                &[&status, &limit],
            )
            .await?;

        rows.iter().map(stored_from_row).collect()
    }

    async fn update_status(
        &self,
        event_id: &str,
        status: FailedEventStatus,
        resolution_notes: Option<&str>,
    ) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"
                UPDATE dlq_events
                SET status = $2,
                    resolution_notes = COALESCE($3, resolution_notes),
                    updated_at = now()
                WHERE event_id = $1
                "#,
                &[&event_id, &status.as_str(), &resolution_notes],
            )
            .await?;

        debug!(event_id = %event_id, status = %status, "Failed event status updated");
        Ok(updated > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
