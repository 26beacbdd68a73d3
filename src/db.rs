use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{touch, ChangeEvent, Fields, Record};
use crate::store::{ChangeHub, RecordStore, Subscription};

const CHANGE_CHANNEL: &str = "record_changes";
const DISABLED_UNITS_KEY: &str = "disabledUnits";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed document store; one JSONB row per document.
///
/// All subscriptions share a single `LISTEN` connection, opened on first use.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    changes: Arc<ChangeHub>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            changes: Arc::new(ChangeHub::new()),
        }
    }
}

async fn listen(
    pool: PgPool,
    sender: broadcast::Sender<ChangeEvent>,
) -> Result<JoinHandle<()>, StoreError> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    debug!(channel = CHANGE_CHANNEL, "listening for record changes");

    Ok(tokio::spawn(async move {
        loop {
            let notification = match listener.recv().await {
                Ok(notification) => notification,
                Err(e) => {
                    warn!(error = %e, "change listener stopped");
                    break;
                }
            };

            match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                // No subscribers is fine.
                Ok(event) => {
                    let _ = sender.send(event);
                }
                Err(e) => debug!(error = %e, "ignoring malformed change payload"),
            }
        }
    }))
}

fn to_record(collection: &str, row: &sqlx::postgres::PgRow) -> Result<Record, StoreError> {
    let fields: Value = row.try_get("fields")?;
    let Value::Object(fields) = fields else {
        return Err(StoreError::Malformed {
            collection: collection.to_string(),
            reason: "fields is not a JSON object".to_string(),
        });
    };

    Ok(Record {
        id: row.try_get("id")?,
        created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        fields,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, fields, created_at FROM division_records.records \
             WHERE collection = $1 ORDER BY created_at, id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| to_record(collection, row)).collect()
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO division_records.records (id, collection, fields)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(collection)
        .bind(Value::Object(fields))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: Uuid,
        mut fields: Fields,
    ) -> Result<(), StoreError> {
        touch(&mut fields);
        let result = sqlx::query(
            r#"
            UPDATE division_records.records
            SET fields = fields || $3, updated_at = now()
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(fields))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id,
            });
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM division_records.records WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError> {
        let pool = self.pool.clone();
        self.changes
            .subscribe_with(collection, |sender| listen(pool, sender))
            .await
    }

    async fn disabled_units(&self) -> Result<BTreeSet<String>, StoreError> {
        let value: Option<Value> =
            sqlx::query("SELECT value FROM division_records.settings WHERE key = $1")
                .bind(DISABLED_UNITS_KEY)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get("value"))
                .transpose()?;

        match value {
            None => Ok(BTreeSet::new()),
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Malformed {
                collection: "settings".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn set_disabled_units(&self, units: &BTreeSet<String>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO division_records.settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(DISABLED_UNITS_KEY)
        .bind(json!(units))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Sample documents as `(source_key, collection, fields)`.
pub fn seed_documents() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        (
            "seed-feeds-001",
            "animal_feeds",
            json!({
                "dateOfMonitoring": "2026-02-03",
                "establishmentName": "Sablayan Agrivet Supply",
                "ownerName": "Rosario Dela Cruz",
                "address": { "municipality": "Sablayan", "province": "Occidental Mindoro" },
                "registrationNumber": "AF-2026-0113",
                "feedType": "Hog grower",
                "ratingQuantity": 5,
                "ratingServicesPersonnel": 4,
                "ratingTraining": 4,
                "ratingAttitude": 5,
                "ratingPromptness": 4,
                "recommendation": "Extend monitoring to barangay outlets",
            }),
        ),
        (
            "seed-feeds-002",
            "animal_feeds",
            json!({
                "dateOfMonitoring": "2026-02-17",
                "establishmentName": "Boac Feeds Center",
                "ownerName": "Danilo Reyes",
                "address": { "municipality": "Boac", "province": "Marinduque" },
                "registrationNumber": "AF-2026-0140",
                "feedType": "Broiler starter",
                "ratingQuantity": "4",
                "ratingServicesPersonnel": "3",
                "ratingTraining": "4",
                "ratingAttitude": "5",
                "ratingPromptness": "3",
            }),
        ),
        (
            "seed-food-001",
            "food_safety",
            json!({
                "dateOfMonitoring": "2026-01-29",
                "establishmentName": "Coron Public Market Stall 14",
                "address": { "municipality": "Coron", "province": "Palawan" },
                "productSampled": "Pork cuts",
                "findings": "Within limits",
                "ratingQuantity": 4,
                "ratingServicesPersonnel": 5,
                "ratingTraining": 3,
                "ratingAttitude": 5,
                "ratingPromptness": 4,
            }),
        ),
        (
            "seed-asf-001",
            "african_swine_fever",
            json!({
                "dateOfCollection": "2026-02-10",
                "farmName": "Naujan Backyard Piggery",
                "ownerName": "Lorna Villareal",
                "municipality": "Naujan",
                "headCount": 18,
                "result": "Negative",
            }),
        ),
        (
            "seed-quarantine-001",
            "quarantine_checkpoints",
            json!({
                "date": "2026-02-12",
                "checkpoint": "Odiongan Port",
                "origin": "Batangas",
                "destination": "Odiongan, Romblon",
                "commodity": "Live hogs",
                "quantity": 40,
                "permitNumber": "VHC-2026-0332",
            }),
        ),
        (
            "seed-survey-001",
            "client_satisfaction",
            json!({
                "date": "2026-02-14",
                "clientName": "Puerto Princesa Poultry Growers",
                "address": "Brgy. San Pedro, Puerto Princesa, Palawan",
                "serviceAvailed": "Laboratory testing",
                "ratingQuantity": 5,
                "ratingServicesPersonnel": 5,
                "ratingTraining": 4,
                "ratingAttitude": 5,
                "ratingPromptness": 5,
            }),
        ),
    ]
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let mut inserted = 0usize;
    for (source_key, collection, fields) in seed_documents() {
        let result = sqlx::query(
            r#"
            INSERT INTO division_records.records (id, collection, fields, source_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(collection)
        .bind(fields)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Builds document fields from a CSV row; `address.province` style headers
/// become nested objects and empty cells are dropped.
pub fn fields_from_csv_row(row: BTreeMap<String, String>) -> Fields {
    let mut fields = Fields::new();

    for (header, cell) in row {
        let cell = cell.trim();
        if cell.is_empty() || header == "source_key" {
            continue;
        }
        let value = Value::String(cell.to_string());

        match header.split_once('.') {
            Some((parent, child)) => {
                let entry = fields
                    .entry(parent.to_string())
                    .or_insert_with(|| Value::Object(Fields::new()));
                if let Value::Object(nested) = entry {
                    nested.insert(child.to_string(), value);
                }
            }
            None => {
                fields.insert(header, value);
            }
        }
    }

    fields
}

pub async fn import_csv(
    pool: &PgPool,
    collection: &str,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<BTreeMap<String, String>>() {
        let row = result?;
        let source_key = row
            .get("source_key")
            .filter(|key| !key.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        let fields = fields_from_csv_row(row);

        let result = sqlx::query(
            r#"
            INSERT INTO division_records.records (id, collection, fields, source_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(collection)
        .bind(Value::Object(fields))
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
