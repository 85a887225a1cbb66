//! Persistence collaborator for subscription records, flight details, and
//! observations. The store holds value documents only; subscribers are
//! referred to by ID, never by embedded back-pointers.

use crate::rid::types::{Observation, SubscriptionRecord};
use crate::store::KeyValueStore;
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const SUBSCRIPTION_PREFIX: &str = "rid_subscription:";
const FLIGHT_DETAILS_PREFIX: &str = "flight_details:";
const OBSERVATION_PREFIX: &str = "observation:";
const FLIGHT_DETAILS_TTL: Duration = Duration::from_secs(300);
const OBSERVATION_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn create_subscription_record(&self, record: &SubscriptionRecord) -> anyhow::Result<()>;
    async fn delete_subscription_record(&self, subscription_id: &str) -> anyhow::Result<()>;
    async fn active_subscription_records(&self) -> anyhow::Result<Vec<SubscriptionRecord>>;
    async fn flight_details_exist(&self, flight_id: &str) -> anyhow::Result<bool>;
    async fn save_flight_details(&self, flight_id: &str, details: &Value) -> anyhow::Result<()>;
    async fn write_observation(&self, observation: &Observation) -> anyhow::Result<()>;
    async fn recent_observations(&self) -> anyhow::Result<Vec<Observation>>;
}

/// [`RecordWriter`] over the shared key/value store.
pub struct StoreRecords {
    store: Arc<dyn KeyValueStore>,
}

impl StoreRecords {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

fn record_ttl(end_datetime: &str) -> Duration {
    let Ok(end) = DateTime::parse_from_rfc3339(end_datetime) else {
        return Duration::from_secs(30);
    };
    let remaining = (end.with_timezone(&Utc) - Utc::now()).num_seconds();
    Duration::from_secs(remaining.max(1) as u64)
}

#[async_trait]
impl RecordWriter for StoreRecords {
    async fn create_subscription_record(&self, record: &SubscriptionRecord) -> anyhow::Result<()> {
        let key = format!("{SUBSCRIPTION_PREFIX}{}", record.subscription_id);
        let value = serde_json::to_string(record).context("serialize subscription record")?;
        self.store.set(&key, &value).await?;
        self.store.expire(&key, record_ttl(&record.end_datetime)).await?;
        Ok(())
    }

    async fn delete_subscription_record(&self, subscription_id: &str) -> anyhow::Result<()> {
        let key = format!("{SUBSCRIPTION_PREFIX}{subscription_id}");
        // The store has no delete; an immediate expiry is equivalent for
        // value documents.
        if self.store.exists(&key).await? {
            self.store.expire(&key, Duration::from_millis(1)).await?;
        }
        Ok(())
    }

    async fn active_subscription_records(&self) -> anyhow::Result<Vec<SubscriptionRecord>> {
        let mut records = Vec::new();
        for key in self.store.scan(SUBSCRIPTION_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<SubscriptionRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key, error = %e, "dropping unreadable subscription record"),
            }
        }
        Ok(records)
    }

    async fn flight_details_exist(&self, flight_id: &str) -> anyhow::Result<bool> {
        self.store
            .exists(&format!("{FLIGHT_DETAILS_PREFIX}{flight_id}"))
            .await
    }

    async fn save_flight_details(&self, flight_id: &str, details: &Value) -> anyhow::Result<()> {
        let key = format!("{FLIGHT_DETAILS_PREFIX}{flight_id}");
        self.store.set(&key, &details.to_string()).await?;
        self.store.expire(&key, FLIGHT_DETAILS_TTL).await?;
        Ok(())
    }

    async fn write_observation(&self, observation: &Observation) -> anyhow::Result<()> {
        let key = format!(
            "{OBSERVATION_PREFIX}{}:{}:{}",
            observation.session_id,
            observation.icao_address,
            uuid::Uuid::new_v4()
        );
        let value = serde_json::to_string(observation).context("serialize observation")?;
        self.store.set(&key, &value).await?;
        self.store.expire(&key, OBSERVATION_TTL).await?;
        Ok(())
    }

    async fn recent_observations(&self) -> anyhow::Result<Vec<Observation>> {
        let mut observations = Vec::new();
        for key in self.store.scan(OBSERVATION_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Observation>(&raw) {
                Ok(observation) => observations.push(observation),
                Err(e) => warn!(key, error = %e, "dropping unreadable observation"),
            }
        }
        Ok(observations)
    }
}
