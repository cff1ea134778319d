use anyhow::Result;
use async_trait::async_trait;

/// Async inference entry point used by the HTTP handlers.
///
/// Returns one probability per output class, in class-index order.
#[async_trait]
pub trait Engine {
    async fn classify(&self, text: String) -> Result<Vec<f32>>;
}

/// A blocking, CPU-bound classifier over a single input text.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Vec<f32>>;
}
