//! Startup and lifecycle of the bridge.
//!
//! ```text
//! Broker ──TLS──▶ Subscriber ──mpsc──▶ Pipeline ──▶ Decoder ──▶ PgImageStore
//! ```

use crate::config::Config;
use crate::error::StartupError;
use crate::identity::Identity;
use crate::pipeline::{Pipeline, PipelineStats};
use crate::store::{ImageStore, PgImageStore};
use crate::subscriber::Subscriber;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A started bridge: identity loaded, store connected and provisioned.
pub struct Bridge {
    config: Config,
    store: Arc<PgImageStore>,
    subscriber: Arc<Subscriber>,
}

impl Bridge {
    /// Bring up everything the subscriber depends on.
    ///
    /// Fails without touching the broker if the identity cannot be loaded or
    /// the store stays unreachable for the whole retry budget.
    pub async fn start(config: Config) -> Result<Self, StartupError> {
        config.validate()?;

        let identity = Identity::load(&config.tls)?;
        let store = PgImageStore::connect(&config.database).await?;
        let subscriber = Subscriber::new(config.mqtt.clone(), identity);

        Ok(Self {
            config,
            store: Arc::new(store),
            subscriber: Arc::new(subscriber),
        })
    }

    /// Run until `shutdown` resolves or the subscriber gives up.
    ///
    /// On shutdown the subscriber disconnects first, queued messages are then
    /// drained by the pipeline, and finally the store is closed.
    pub async fn run<F>(self, shutdown: F) -> Result<PipelineStats>
    where
        F: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::channel(self.config.mqtt.channel_capacity);
        let cancel = CancellationToken::new();

        let store: Arc<dyn ImageStore> = self.store.clone();
        let pipeline = Pipeline::new(store);
        let worker = tokio::spawn(async move { pipeline.run(rx).await });

        let mut subscriber_handle = tokio::spawn({
            let subscriber = self.subscriber.clone();
            let cancel = cancel.clone();
            async move { subscriber.run(tx, cancel).await }
        });

        info!(topic = %self.config.mqtt.topic, "Image bridge running");

        let subscriber_result = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested, stopping subscriber");
                cancel.cancel();
                (&mut subscriber_handle).await
            }
            result = &mut subscriber_handle => result,
        };

        let stats = worker.await.context("Pipeline task panicked")?;
        self.store.close().await;

        match subscriber_result.context("Subscriber task panicked")? {
            Ok(()) => Ok(stats),
            Err(e) => {
                error!(error = %e, state = ?self.subscriber.state(), "Subscriber terminated");
                Err(e).context("MQTT subscriber failed")
            }
        }
    }
}
