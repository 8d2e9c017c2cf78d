//! Relay, consumer, and handler runtime for the transactional event delivery substrate.
//!
//! This crate wires `substrate-core`'s traits into two long-running loops:
//!
//! - [`relay::Relay`]: drains the transactional outbox into the stream transport.
//! - [`consumer::Consumer`]: drains one stream's consumer group, dispatching to
//!   [`handler::Handler`] implementations registered in a [`registry::HandlerRegistry`].
//!
//! Both loops are plain async functions taking a `tokio::sync::watch::Receiver<bool>` for
//! cooperative shutdown; nothing here spawns its own tasks except the two loops' own
//! internal work, so the binary entry point controls its own task topology.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod retry;

pub use config::{Config, ConfigError};
pub use consumer::{Consumer, ConsumerError};
pub use handler::{Handler, HandlerError};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
pub use relay::{Relay, RelayError};
