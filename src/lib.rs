//! fetchq core library
//!
//! A client-side HTTP request engine: prioritized request queueing, a tiered
//! response cache with promotion, per-request retry with growing timeouts,
//! callbacks delivered on one context, and resumable file downloads with
//! pause/resume.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`request`] - Requests, strategies (text, JSON, file) and responses
//! - [`queue`] - Admission, priority ordering and worker management
//! - [`cache`] - Cache tiers and the promoting [`CacheChain`](cache::CacheChain)
//! - [`network`] - The transport capability and its `reqwest` implementation
//! - [`retry`] - Retry policy with timeout back-off
//! - [`delivery`] - The context listener callbacks run on
//! - [`download`] - Bounded-parallelism download scheduler
//! - [`engine`] - Wires all of the above from an [`EngineConfig`]
//!
//! Requests move from the queue to the cache worker, which answers from cache
//! or forwards to the network workers; every outcome reaches the caller's
//! [`Listener`] through [`Delivery`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod delivery;
pub(crate) mod dispatch;
pub mod download;
pub mod engine;
pub mod error;
pub mod listener;
pub mod network;
pub mod queue;
pub mod request;
pub mod retry;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use delivery::{Delivery, DeliveryLoop};
pub use download::{DownloadController, DownloadStatus, DownloaderError, FileDownloader};
pub use engine::{Engine, EngineError};
pub use error::RequestError;
pub use listener::Listener;
pub use queue::{QueueOptions, RequestQueue};
pub use request::{Priority, Request, Response};
pub use retry::{RetryDecision, RetryPolicy};
