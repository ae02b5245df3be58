use async_trait::async_trait;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use postsync_common::{AggregateSnapshot, TrackedRecord};

use super::backend::Broadcaster;

/// Posts change notifications as JSON to a single HTTP endpoint.
pub struct WebhookBroadcaster {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookBroadcaster {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Broadcast webhook returned non-success");
            anyhow::bail!("Broadcast webhook returned {status}");
        }

        Ok(())
    }
}

/// Payload for a status change. Only channel state is sent; captions stay local.
pub(crate) fn status_payload(record: &TrackedRecord) -> serde_json::Value {
    let channels: serde_json::Map<String, serde_json::Value> = record
        .channels
        .iter()
        .map(|(channel, post)| {
            (
                channel.to_string(),
                json!({
                    "status": post.status,
                    "external_id": post.external_id,
                    "external_posted_at": post.external_posted_at,
                    "failed_at": post.failed_at,
                    "failure_reason": post.failure_reason,
                }),
            )
        })
        .collect();

    json!({
        "type": "status_changed",
        "record_id": record.id,
        "channels": channels,
    })
}

#[async_trait]
impl Broadcaster for WebhookBroadcaster {
    async fn notify_status_changed(&self, record: &TrackedRecord) -> anyhow::Result<()> {
        self.post(status_payload(record)).await
    }

    async fn notify_metrics_updated(&self, record_id: Uuid, snapshot: &AggregateSnapshot) -> anyhow::Result<()> {
        self.post(json!({
            "type": "metrics_updated",
            "record_id": record_id,
            "aggregate": snapshot,
        }))
        .await
    }
}
