//! Durable alert state: rule definitions and the live alert set.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use vigil_core::error::{Result, VigilError};
use vigil_core::model::alert::Alert;
use vigil_core::model::rule::AlertRule;

pub const RULES_FILE: &str = "rules.json";
pub const ACTIVE_ALERTS_FILE: &str = "active-alerts.json";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<AlertRule>>;
    async fn save_rules(&self, rules: &[AlertRule]) -> Result<()>;
    async fn load_active_alerts(&self) -> Result<Vec<Alert>>;
    async fn save_active_alerts(&self, alerts: &[Alert]) -> Result<()>;
}

/// Two JSON array documents in one directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_array<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(VigilError::Io(format!("read {}: {err}", path.display()))),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| VigilError::Store(format!("decode {}: {e}", path.display())))
    }

    async fn write_array<T: Serialize>(&self, file: &str, items: &[T]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VigilError::Io(format!("create {}: {e}", self.dir.display())))?;

        let body = serde_json::to_vec_pretty(items)
            .map_err(|e| VigilError::Store(format!("encode {file}: {e}")))?;
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| VigilError::Io(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| VigilError::Io(format!("rename {}: {e}", path.display())))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_rules(&self) -> Result<Vec<AlertRule>> {
        self.read_array(RULES_FILE).await
    }

    async fn save_rules(&self, rules: &[AlertRule]) -> Result<()> {
        self.write_array(RULES_FILE, rules).await
    }

    async fn load_active_alerts(&self) -> Result<Vec<Alert>> {
        self.read_array(ACTIVE_ALERTS_FILE).await
    }

    async fn save_active_alerts(&self, alerts: &[Alert]) -> Result<()> {
        self.write_array(ACTIVE_ALERTS_FILE, alerts).await
    }
}

#[cfg(test)]
mod tests {
    use testkit::cpu_rule;

    use super::*;

    #[tokio::test]
    async fn missing_files_load_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::new(dir.path().join("nested"));
        assert!(store.load_rules().await?.is_empty());
        assert!(store.load_active_alerts().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rules_survive_a_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::new(dir.path().join("state"));
        store.save_rules(&[cpu_rule(80.0)]).await?;

        let raw = std::fs::read_to_string(dir.path().join("state").join(RULES_FILE))?;
        assert!(raw.trim_start().starts_with('['));

        let loaded = store.load_rules().await?;
        assert_eq!(loaded, vec![cpu_rule(80.0)]);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(ACTIVE_ALERTS_FILE), "{not json")?;
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_active_alerts().await.is_err());
        Ok(())
    }
}
