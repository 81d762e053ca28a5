//! # Verdant Sync
//!
//! Mutation dispatch and real-time reconciliation for the Verdant client.
//!
//! This crate provides:
//! - [`SyncCoordinator`]: sends queued writes with bounded concurrency,
//!   retries transient failures with backoff and parks exhausted writes
//! - [`PushListener`]: keeps the push channel open, reconnects with backoff
//!   and gap-fills missed events after a reconnect
//! - [`Reconciler`]: the single merge policy for push events and write
//!   outcomes
//! - [`SyncClient`]: the session facade the UI talks to
//! - Port traits for the backend and an HTTP adapter
//!
//! ## Architecture
//!
//! ```text
//!   UI ──enqueue──▶ MutationQueue ──▶ SyncCoordinator ──▶ RemoteWritePort
//!   │                    │                   │
//!   │ reads              │ optimistic        │ ack / error
//!   ▼                    ▼                   ▼
//! EntityStore ◀──────────────────────── Reconciler ◀── PushListener ◀── RemotePushPort
//! ```
//!
//! ## Key Invariants
//!
//! - Every write is visible in the store before `enqueue` returns
//! - Writes to one post reach the server in enqueue order
//! - Transient failures never revert a write; permanent ones revert it once
//! - The local user's own push events never change the store
//! - A push event changes the store at most once
//! - Nothing is delivered to the store after logout

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Library code propagates errors instead of panicking.
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod client;
mod config;
mod coordinator;
mod error;
mod http;
mod ports;
mod push;
mod reconciler;
mod state;

pub use client::{SyncClient, SyncPorts};
pub use config::{PushConfig, RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use http::{
    classify_status, HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpWritePort,
    IDEMPOTENCY_KEY_HEADER,
};
pub use ports::{
    CredentialSource, EntityFetchPort, PushConnection, RemotePushPort, RemoteWritePort,
    StaticCredential,
};
pub use push::PushListener;
pub use reconciler::{PushOutcome, Reconciler, SyncEvent};
pub use state::ConnectionState;
