/// Delivery bridge: progress updates → storage API
///
/// Every ingested update is handed to a `ProgressStore` on its own task. The
/// fan-out path never waits for it, and a failed write is only logged: the
/// value other clients already received is not retracted.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sync_events::ProgressUpdate;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::error::{AppError, Result};
use crate::metrics;

/// Durable write side for progress updates
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save_progress(&self, update: &ProgressUpdate) -> Result<()>;
}

/// Stores progress by POSTing to the user-progress HTTP endpoint
pub struct HttpProgressStore {
    client: reqwest::Client,
    url: String,
}

impl HttpProgressStore {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ProgressStore for HttpProgressStore {
    async fn save_progress(&self, update: &ProgressUpdate) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "user_id": update.user_id,
                "manga_id": update.manga_id,
                "chapter": update.chapter,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::DeliveryStatus(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct DeliveryBridge {
    store: Option<Arc<dyn ProgressStore>>,
}

impl DeliveryBridge {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A bridge that drops every update
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        match &config.api_url {
            Some(url) => Ok(Self::new(Arc::new(HttpProgressStore::new(
                url.clone(),
                config.request_timeout,
            )?))),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Forward an update in the background.
    ///
    /// Returns the task handle, or `None` when the bridge is disabled.
    pub fn forward(&self, update: ProgressUpdate) -> Option<JoinHandle<()>> {
        let store = self.store.clone()?;

        Some(tokio::spawn(async move {
            match store.save_progress(&update).await {
                Ok(()) => debug!(
                    user_id = %update.user_id,
                    manga_id = %update.manga_id,
                    chapter = update.chapter,
                    "progress persisted"
                ),
                Err(e) => {
                    metrics::record_delivery_failure();
                    warn!(
                        user_id = %update.user_id,
                        manga_id = %update.manga_id,
                        error = %e,
                        "failed to sync progress with API"
                    );
                }
            }
        }))
    }
}
