//! Settings storage: a key-value table of JSON documents.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use sqlx::SqlitePool;
use tether_protocol::settings::GlobalSettings;

const GLOBAL_KEY: &str = "global";

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching setting")?;

        row.map(|(raw,)| serde_json::from_str(&raw).with_context(|| format!("parsing setting {key}")))
            .transpose()
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("saving setting")?;
        Ok(())
    }

    /// Stored global settings, defaults filling anything unset.
    pub async fn get_global(&self) -> Result<GlobalSettings> {
        match self.get(GLOBAL_KEY).await? {
            Some(value) => serde_json::from_value(value).context("parsing global settings"),
            None => Ok(GlobalSettings::default()),
        }
    }

    /// Replace the global settings document.
    pub async fn save_global(&self, settings: &GlobalSettings) -> Result<()> {
        self.set(GLOBAL_KEY, &serde_json::to_value(settings)?).await
    }

    /// Merge the top-level fields of `patch` into the global settings.
    pub async fn update_global(&self, patch: &Value) -> Result<GlobalSettings> {
        let Some(fields) = patch.as_object() else {
            bail!("settings patch must be an object");
        };
        let mut current = serde_json::to_value(self.get_global().await?)?;
        if let Some(target) = current.as_object_mut() {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        let merged: GlobalSettings =
            serde_json::from_value(current).context("invalid settings value")?;
        self.save_global(&merged).await?;
        Ok(merged)
    }
}
