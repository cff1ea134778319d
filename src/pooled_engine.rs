use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::engine::{Classifier, Engine};

/// Runs a blocking [`Classifier`] on tokio's blocking pool, with at most
/// `workers` inferences in flight at once.
pub struct PooledEngine {
    classifier: Arc<dyn Classifier>,
    permits: Arc<Semaphore>,
}

impl PooledEngine {
    pub fn new(classifier: Arc<dyn Classifier>, workers: usize) -> Self {
        let workers = workers.max(1);
        tracing::debug!(workers, "Inference pool created");
        Self {
            classifier,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }
}

#[async_trait]
impl Engine for PooledEngine {
    #[tracing::instrument(skip(self, text), fields(text_len = text.len()))]
    async fn classify(&self, text: String) -> Result<Vec<f32>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("Inference pool is closed"))?;

        let classifier = Arc::clone(&self.classifier);
        let start = Instant::now();

        // The permit moves into the worker so it is released only once the
        // blocking call returns, even if the caller went away.
        let probabilities = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            classifier.classify(&text)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Inference worker failed: {e}"))??;

        tracing::debug!(
            inference_time_ms = start.elapsed().as_millis(),
            "Inference finished"
        );
        Ok(probabilities)
    }
}
