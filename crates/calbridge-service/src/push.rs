//! Outstanding webhook channel descriptors, persisted as a JSON file.
//!
//! The daemon rewrites the file atomically (tmp + rename); the format is
//! fixed and shared with external tooling.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// One registered push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChannel {
    pub calendar_id: String,
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: DateTime<Utc>,
    pub address: String,
}

/// File-backed store for channel descriptors
#[derive(Debug, Clone)]
pub struct PushChannelStore {
    path: PathBuf,
}

impl PushChannelStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ## Summary
    /// Loads all descriptors; a missing file reads as an empty set.
    ///
    /// ## Errors
    /// Returns a validation error for unreadable or malformed content.
    pub async fn load(&self) -> ServiceResult<Vec<PushChannel>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ServiceError::ValidationError(format!(
                    "malformed channel file {}: {e}",
                    self.path.display()
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(ServiceError::ValidationError(format!(
                "cannot read channel file {}: {err}",
                self.path.display()
            ))),
        }
    }

    /// ## Summary
    /// Atomically rewrites the descriptor file via a temp file and rename.
    ///
    /// ## Errors
    /// Returns a validation error when the write or rename fails.
    pub async fn save(&self, channels: &[PushChannel]) -> ServiceResult<()> {
        let body = serde_json::to_vec_pretty(channels).map_err(|e| {
            ServiceError::ValidationError(format!("cannot serialize channels: {e}"))
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await.map_err(|e| {
            ServiceError::ValidationError(format!("cannot write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ServiceError::ValidationError(format!(
                "cannot move {} into place: {e}",
                tmp.display()
            ))
        })?;
        Ok(())
    }

    /// ## Summary
    /// Channels whose expiration falls inside the renewal lead window.
    ///
    /// ## Errors
    /// Propagates load failures.
    pub async fn expiring_within(
        &self,
        lead: TimeDelta,
        now: DateTime<Utc>,
    ) -> ServiceResult<Vec<PushChannel>> {
        let channels = self.load().await?;
        Ok(channels
            .into_iter()
            .filter(|c| c.expiration <= now + lead)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn channel(id: &str, expiration: DateTime<Utc>) -> PushChannel {
        PushChannel {
            calendar_id: "primary".to_string(),
            channel_id: id.to_string(),
            resource_id: format!("res-{id}"),
            expiration,
            address: "https://hooks.example.com/notify".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = std::env::temp_dir().join(format!("push-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = PushChannelStore::new(dir.join("push_channels.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("push-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = PushChannelStore::new(dir.join("push_channels.json"));

        let expiration = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let channels = vec![channel("ch-1", expiration)];
        store.save(&channels).await.unwrap();

        assert_eq!(store.load().await.unwrap(), channels);

        // The wire format is fixed: camelCase keys
        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(raw.contains("\"calendarId\""));
        assert!(raw.contains("\"channelId\""));
        assert!(raw.contains("\"resourceId\""));
    }

    #[tokio::test]
    async fn expiring_within_filters_by_lead() {
        let dir = std::env::temp_dir().join(format!("push-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = PushChannelStore::new(dir.join("push_channels.json"));

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let soon = channel("soon", now + TimeDelta::minutes(30));
        let later = channel("later", now + TimeDelta::days(2));
        store.save(&[soon.clone(), later]).await.unwrap();

        let due = store
            .expiring_within(TimeDelta::hours(1), now)
            .await
            .unwrap();
        assert_eq!(due, vec![soon]);
    }
}
