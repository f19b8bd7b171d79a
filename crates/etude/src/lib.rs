// src/lib.rs
//! etude: a socket-level HTTP/1.x connection engine.
//!
//! An [`Engine`] runs a fixed set of worker threads, each with its own
//! single-threaded event loop and buffer pool. Servers bound with
//! [`Engine::create_server`] accept on every worker through reuse-port
//! sockets; each connection stays on the worker that accepted it and is
//! driven by a frame that parses requests, calls the [`Application`] and
//! frames the response.
pub mod address;
pub mod body;
pub mod chain;
pub mod config;
pub mod conn;
pub mod context;
pub mod date;
pub mod engine;
pub mod error;
pub mod filter;
pub mod frame;
pub mod headers;
pub mod http;
mod listener;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod upgrade;
mod worker;

// Re-exports for users
pub use address::ServerAddress;
pub use async_trait::async_trait;
pub use config::{EngineConfig, ServerLimits};
pub use conn::ConnectionInfo;
pub use context::{Lifetime, ServiceContext, ServiceContextBuilder};
pub use date::DateHeaderCache;
pub use engine::{Engine, ServerHandle};
pub use error::{BoxError, EngineError, EngineResult, ParseError};
pub use filter::{BoxedStream, ConnectionFilter, Duplex};
pub use frame::{Application, Exchange};
pub use headers::Headers;
pub use crate::http::{Method, RequestHead, ResponseHead, Version};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use pool::{MemoryBlock, MemoryPool};
pub use upgrade::Upgraded;
