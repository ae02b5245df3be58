//! JSON-file-backed record store for standalone deployments.
//!
//! The whole record set lives in memory and is rewritten to disk after every
//! successful mutation (temp file + rename, so a crash leaves the previous
//! version intact). A failed write rolls the in-memory change back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use postsync_common::{AggregateSnapshot, Channel, MetricSnapshot, StoreError, TrackedRecord};

use super::memory::MemoryRecordStore;
use crate::selector::DueQuery;
use crate::traits::RecordStore;

pub struct FileRecordStore {
    inner: MemoryRecordStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Load records from `path`, or start empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<TrackedRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(StoreError::from)
                .with_context(|| format!("Failed to parse record file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::from(e))
                    .with_context(|| format!("Failed to read record file: {}", path.display()));
            }
        };
        info!(path = %path.display(), records = records.len(), "Opened record file");

        Ok(Self {
            inner: MemoryRecordStore::with_records(records),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace a record and persist. Used by the scheduling side and tests.
    pub async fn upsert(&self, record: TrackedRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.get(record.id);
        let id = record.id;
        self.inner.upsert(record);
        self.commit(id, previous, true).await
    }

    pub fn all(&self) -> Vec<TrackedRecord> {
        self.inner.all()
    }

    async fn write_snapshot(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.inner.all()).map_err(StoreError::from)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(StoreError::from)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(StoreError::from)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Persist a mutation of `id`. If the write fails, the in-memory record is
    /// put back to `previous` so memory never runs ahead of disk.
    /// Callers hold `write_lock` across the mutation and this call.
    async fn commit(&self, id: Uuid, previous: Option<TrackedRecord>, changed: bool) -> Result<()> {
        if !changed {
            return Ok(());
        }
        if let Err(e) = self.write_snapshot().await {
            match previous {
                Some(record) => self.inner.upsert(record),
                None => self.inner.remove(id),
            }
            warn!(record_id = %id, path = %self.path.display(), error = %e, "Record file write failed, change rolled back");
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn find_due_for_refresh(&self, channel: Channel, query: &DueQuery) -> Result<Vec<TrackedRecord>> {
        self.inner.find_due_for_refresh(channel, query).await
    }

    async fn find_unresolved_in_window(
        &self,
        channel: Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackedRecord>> {
        self.inner.find_unresolved_in_window(channel, start, end).await
    }

    async fn find_stale_in_flight(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<Vec<TrackedRecord>> {
        self.inner.find_stale_in_flight(channel, cutoff).await
    }

    async fn find_by_external_id(&self, channel: Channel, external_id: &str) -> Result<Option<TrackedRecord>> {
        self.inner.find_by_external_id(channel, external_id).await
    }

    async fn apply_match(
        &self,
        record_id: Uuid,
        channel: Channel,
        external_id: &str,
        posted_at: DateTime<Utc>,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.get(record_id);
        let result = self
            .inner
            .apply_match(record_id, channel, external_id, posted_at, metrics)
            .await?;
        self.commit(record_id, previous, result.is_some()).await?;
        Ok(result)
    }

    async fn apply_metrics_refresh(
        &self,
        record_id: Uuid,
        channel: Channel,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.get(record_id);
        let result = self.inner.apply_metrics_refresh(record_id, channel, metrics).await?;
        self.commit(record_id, previous, result.is_some()).await?;
        Ok(result)
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        channel: Channel,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.get(record_id);
        let result = self.inner.mark_failed(record_id, channel, reason, failed_at).await?;
        self.commit(record_id, previous, result.is_some()).await?;
        Ok(result)
    }

    async fn update_aggregate(&self, record_id: Uuid) -> Result<AggregateSnapshot> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.get(record_id);
        let snapshot = self.inner.update_aggregate(record_id).await?;
        self.commit(record_id, previous, true).await?;
        Ok(snapshot)
    }
}
