//! Encrypted label sync against the remote label service.
//!
//! - `client`: HTTP requests and response classification
//! - `nonce`: the per-wallet optimistic concurrency counter
//! - `session`: push / pull / single-label upload for one wallet
//! - `registry`: active sessions, background tasks and failure routing

pub mod client;
pub mod config;
pub mod models;
pub mod nonce;
pub mod registry;
pub mod session;

#[cfg(test)]
mod tests;

pub use client::{
    HttpRequest, HttpResponse, Method, ReqwestTransport, SyncClient, Transport, TransportError,
};
pub use config::LabelSyncConfig;
pub use models::{
    LabelBatchRequest, LabelRequest, PullOutcome, PullResponse, SessionStatus, WireLabel,
};
pub use nonce::{get_nonce, set_nonce};
pub use registry::{NoopObserver, SessionRegistry, ShutdownReport, SyncObserver};
pub use session::WalletSyncSession;
