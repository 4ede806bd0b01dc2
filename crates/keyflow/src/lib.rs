// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # keyflow
//!
//! Multi-credential LLM API rotation. Keyflow accepts a request for a
//! model, selects one of many equivalent credentials (API keys or OAuth
//! sessions) belonging to that model's provider, performs the upstream
//! call, records the outcome against per-credential usage bookkeeping, and
//! on failure reclassifies the error and retries with a different
//! credential. Callers see one high-throughput endpoint; the library
//! absorbs per-credential rate limits, quota exhaustion, auth errors, and
//! transient upstream faults.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Client                                                     │
//! │   execute / execute_streaming / admin API                  │
//! └──────────────┬─────────────────────────────────────────────┘
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │ RequestExecutor            retry / rotation loop           │
//! │   select -> acquire -> upstream effect -> classify -> record│
//! └───┬──────────────────────────────┬─────────────────────────┘
//!     ▼                              ▼
//! ┌──────────────────┐   ┌──────────────────────────────────────┐
//! │ SelectionEngine  │   │ TrackingEngine (owns all state)      │
//! │  LimitEngine     │──▶│  windows · totals · cooldowns ·      │
//! │  rotation        │   │  fair cycle · concurrency            │
//! │  strategies      │   └───────────────┬──────────────────────┘
//! └──────────────────┘                   ▼
//!                          ┌──────────────────────────┐
//!                          │ UsageStorage (JSON,      │
//!                          │ atomic, coalesced)       │
//!                          └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keyflow::{Client, ExecuteOptions};
//!
//! let client = Client::builder()
//!     .with_provider(Arc::new(my_provider))
//!     .with_storage_dir("data/usage")
//!     .build();
//!
//! let response = client
//!     .execute("acme", "acme-large", &payload, None)
//!     .await?;
//! ```
//!
//! Providers implement the [`Provider`] trait: the opaque upstream effect,
//! a static quota-group table, and optional hooks for request accounting
//! and background quota refresh. The core never parses wire protocols and
//! never logs a raw credential; every log line goes through
//! [`classify::mask_credential`].

pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod identity;
pub mod limits;
pub mod manager;
pub mod provider;
pub mod refresher;
pub mod selection;
pub mod state;
pub mod storage;
pub mod tracking;
pub mod windows;

pub use classify::{classify, mask_credential, ClassifiedError, ErrorKind, UpstreamFailure};
pub use client::{Client, ClientBuilder};
pub use config::{
    CapCooldown, CapLimit, CustomCap, FairCycleConfig, ProviderConfig, ResetMode, RotationMode,
    TierKey, TrackingMode, WindowDefinition, WindowScope,
};
pub use error::{Error, Result};
pub use executor::{ExecuteOptions, PreRequestHook, RequestExecutor};
pub use identity::CredentialRegistry;
pub use manager::UsageManager;
pub use provider::{
    ChunkStream, CompletionEvent, CompletionOverride, Provider, ProviderResponse, RequestContext,
    StreamChunk,
};
pub use selection::AvailabilityStats;
pub use state::{CredentialState, TokenCounts, UsageUpdate};
pub use storage::{UsageSnapshot, UsageStorage};
