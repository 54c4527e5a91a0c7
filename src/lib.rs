//! Tubeflow Core Library
//!
//! An event-driven video download pipeline: download commands arrive on a
//! message broker, handlers fetch the videos with an external downloader and
//! announce the results as events, which are in turn catalogued.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`broker`] - Topic fan-out over durable and exclusive queues
//! - [`pipeline`] - Publish/subscribe with ack-after-callback delivery
//! - [`message`] - Command and event families, wire encoding
//! - [`store`] - Idempotent message log and video catalogue
//! - [`video`] - Download orchestration over a video capability
//! - [`handler`] - Command/event handlers and their supervision
//! - [`db`] - Database connection and schema management
//! - [`config`] - Process configuration
//! - [`runtime`] - Process wiring from configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod config;
pub mod db;
pub mod handler;
pub mod message;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod video;

// Re-export commonly used types
pub use broker::{BrokerClient, BrokerError, InMemoryBroker, SqliteBroker, SubscriptionMode};
pub use config::{AppConfig, ConfigError};
pub use db::{Database, DatabaseOptions};
pub use handler::{HandlerHost, Supervisor, SupervisorError, SupervisorSettings};
pub use message::{Command, Event, Message};
pub use pipeline::MessagePipeline;
pub use store::{MessageStore, StoreError};
pub use video::{DownloadService, RetryPolicy, VideoError};
