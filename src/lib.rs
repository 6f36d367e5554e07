//! # NtripHub Core Library
//!
//! NtripHub is a gateway that holds open many concurrent NTRIP/TCP
//! correction-data streams and republishes each stream's bytes to an MQTT
//! broker under a per-source topic, optionally demultiplexing the RTCM
//! framing so that individual message types land on their own sub-topics.
//!
//! ## Architecture Overview
//!
//! The gateway is built around a small set of long-running components:
//!
//! - [`hub::Poller`] - reconciles the live connection set against the
//!   source registry, dialing missing sources with a bounded fan-out pool
//! - [`hub::Multiplexer`] - a single select loop watching every open
//!   socket plus a control channel, feeding received bytes onto the bus
//! - [`hub::PublishWorker`] - a pool draining the bus and publishing to
//!   the MQTT broker, with per-worker reconnect handling
//! - [`rtcm`] - frame reassembly for byte streams split arbitrarily
//!   across socket reads
//! - [`registry`] - the sqlite-backed registry of configured sources
//!
//! Data flows one way: socket bytes -> bus -> broker. The bus is sharded
//! by source id so that bytes from one source are always published by the
//! same worker, preserving per-source ordering across the pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ntriphub::{GatewayConfig, Hub};
//!
//! #[tokio::main]
//! async fn main() -> ntriphub::Result<()> {
//!     let config = GatewayConfig::default();
//!     let hub = Hub::new(config)?;
//!     hub.run().await
//! }
//! ```

pub mod config;
pub mod hub;
pub mod registry;
pub mod rtcm;
pub mod source;

pub use config::GatewayConfig;
pub use hub::{BusMessage, Hub, HubCommand, Multiplexer, Poller, PublishWorker};
pub use registry::{SourcePatch, SourceRecord, SourceStore};
pub use rtcm::{extract_frames, Frame};
pub use source::{Scheme, SourceUrl};

use thiserror::Error;

/// NtripHub error types
///
/// All recoverable steady-state failures (dial rejections, socket errors,
/// publish failures) are logged and contained by the component that hit
/// them; variants of this enum surface only where a caller can act on the
/// failure, and the process aborts only on startup configuration errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Socket and filesystem I/O failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source registry (sqlite) failures
    #[error("Registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A source's connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidSource(String),

    /// The upstream caster rejected or failed the NTRIP handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A dial attempt did not complete within the source's timeout
    #[error("Dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    /// Internal task plumbing failures (join errors, closed channels)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias used throughout the gateway
pub type Result<T> = std::result::Result<T, HubError>;
