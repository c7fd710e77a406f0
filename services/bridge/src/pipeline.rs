//! Per-message processing: decode, validate, persist.
//!
//! Messages are handled one at a time in the order the subscriber received
//! them. Any failure is contained to the message that caused it.

use crate::decoder::{self, DecodeError};
use crate::store::{ImageStore, PersistError};
use crate::subscriber::IncomingPublish;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

/// Result of handling a single message.
#[derive(Debug)]
pub enum Outcome {
    Stored { id: i64 },
    Rejected(DecodeError),
    Dropped(PersistError),
}

/// Counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub stored: u64,
    pub rejected: u64,
    pub dropped: u64,
}

impl PipelineStats {
    fn record(&mut self, outcome: &Outcome) {
        self.received += 1;
        match outcome {
            Outcome::Stored { .. } => self.stored += 1,
            Outcome::Rejected(_) => self.rejected += 1,
            Outcome::Dropped(_) => self.dropped += 1,
        }
    }
}

/// Decodes incoming messages and writes them to the store.
pub struct Pipeline {
    store: Arc<dyn ImageStore>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }

    /// Handle one message. Never fails; errors are logged and reported in the outcome.
    #[instrument(skip(self, message), fields(topic = %message.topic, size_bytes = message.payload.len()))]
    pub async fn handle(&self, message: IncomingPublish) -> Outcome {
        let decoded = match decoder::decode(&message.payload, &message.topic, message.received_at) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    received_at = %message.received_at,
                    error = %e,
                    error_detail = ?e,
                    "Rejected malformed message"
                );
                metrics::counter!("bridge.messages.decode_failed").increment(1);
                return Outcome::Rejected(e);
            }
        };

        match self.store.persist(&decoded).await {
            Ok(id) => {
                info!(
                    id = id,
                    topic = %decoded.topic,
                    size_bytes = decoded.image.len(),
                    width = decoded.width,
                    height = decoded.height,
                    "Image saved"
                );
                metrics::counter!("bridge.messages.stored").increment(1);
                Outcome::Stored { id }
            }
            Err(e) => {
                // No redelivery: the message is lost here.
                error!(
                    topic = %decoded.topic,
                    received_at = %decoded.received_at,
                    error = %e,
                    error_detail = ?e,
                    "Failed to persist message, dropping it"
                );
                metrics::counter!("bridge.messages.persist_failed").increment(1);
                Outcome::Dropped(e)
            }
        }
    }

    /// Process messages until the channel closes, draining anything already queued.
    pub async fn run(&self, mut rx: mpsc::Receiver<IncomingPublish>) -> PipelineStats {
        info!("Pipeline started");
        let mut stats = PipelineStats::default();

        while let Some(message) = rx.recv().await {
            let outcome = self.handle(message).await;
            stats.record(&outcome);
        }

        info!(
            received = stats.received,
            stored = stats.stored,
            rejected = stats.rejected,
            dropped = stats.dropped,
            "Pipeline stopped"
        );
        stats
    }
}
