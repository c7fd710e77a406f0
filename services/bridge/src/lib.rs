//! Image Bridge
//!
//! Subscribes to a mutual-TLS MQTT topic carrying camera frames and records
//! every valid message in PostgreSQL.
//!
//! ## Features
//!
//! - **Mutual TLS**: client certificate authentication against a trusted root,
//!   with identity material held in memory
//! - **Bounded Reconnection**: fixed-delay retry for both the broker session
//!   and the database connection, fatal once the budget is spent
//! - **Fault Isolation**: a malformed or unwritable message is logged and
//!   skipped without disturbing the rest of the stream
//! - **Idempotent Provisioning**: the destination table is created on startup
//!   if it does not already exist
//!
//! ## Architecture
//!
//! ```text
//! MQTT Broker               Bridge                         PostgreSQL
//! ┌──────────────┐   ┌──────────────┐                  ┌────────────────┐
//! │ test/topic/  │──▶│ Subscriber   │                  │ image_messages │
//! │   image      │   └──────────────┘                  └────────────────┘
//! └──────────────┘          │ mpsc                            ▲
//!                           ▼                                 │
//!                    ┌──────────────┐   ┌──────────────┐      │
//!                    │ Pipeline     │──▶│ Decoder      │      │
//!                    └──────────────┘   └──────────────┘      │
//!                           │                                 │
//!                           ▼                                 │
//!                    ┌──────────────┐                         │
//!                    │ ImageStore   │─────────────────────────┘
//!                    └──────────────┘
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod subscriber;

pub use config::Config;
pub use decoder::{decode, DecodeError, ImageMessage};
pub use error::StartupError;
pub use identity::{ClientAuth, Identity, IdentityError};
pub use pipeline::{Outcome, Pipeline, PipelineStats};
pub use service::Bridge;
pub use store::{ImageStore, MemoryStore, PersistError, PgImageStore, StoreError, StoredRecord};
pub use subscriber::{
    ConnectionState, IncomingPublish, ReconnectPolicy, ReconnectionDecision, Subscriber,
    SubscriberError,
};
