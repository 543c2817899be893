//! Fixed-size permit pool in front of the embedding provider.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::embedder::{Embedder, EmbedderError, EmbedderInfo};

/// One granted provider slot. Dropping it returns the slot to the pool, so
/// a permit is released on every exit path including provider failure.
struct Permit {
    slot_tx: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.slot_tx.try_send(());
    }
}

/// Wraps an [`Embedder`] behind a fixed pool of N permits. Callers beyond N
/// block on acquisition; this is the core's sole backpressure point. The
/// gateway does not retry and does not cache.
pub struct EmbeddingGateway {
    provider: Arc<dyn Embedder>,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    max_concurrency: usize,
}

impl EmbeddingGateway {
    /// `max_concurrency` below 1 is clamped to 1.
    pub fn new(provider: Arc<dyn Embedder>, max_concurrency: usize) -> Self {
        let bound = max_concurrency.max(1);
        let (slot_tx, slot_rx) = bounded(bound);
        for _ in 0..bound {
            let _ = slot_tx.send(());
        }
        Self {
            provider,
            slot_tx,
            slot_rx,
            max_concurrency: bound,
        }
    }

    /// Embeds one text, holding a permit for the full provider call.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let _permit = self.acquire()?;
        self.provider.embed(text)
    }

    pub fn info(&self) -> &EmbedderInfo {
        self.provider.info()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn acquire(&self) -> Result<Permit, EmbedderError> {
        self.slot_rx
            .recv()
            .map_err(|_| EmbedderError::ProviderFailure {
                message: "embedding permit pool is closed".into(),
            })?;
        Ok(Permit {
            slot_tx: self.slot_tx.clone(),
        })
    }
}
