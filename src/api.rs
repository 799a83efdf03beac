//! Upgrade status API: wire types, source trait, and HTTP client.

pub mod client;
pub mod types;

pub use client::UpgradeApiClient;
// `StepState` is only consumed by test modules, but re-exporting keeps the
// public API consistent across `crate::api::*`.
#[allow(unused_imports)]
pub use types::{StatusSnapshot, StepState, StepStatus};

use async_trait::async_trait;

use crate::error::PuwError;

/// Read-only source of upgrade status snapshots.
///
/// The watcher and flag synchronizer depend on this seam only; the
/// production implementation is [`UpgradeApiClient`]. Implementations must
/// be safe to call from multiple concurrent watches.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn get_status(&self) -> Result<StatusSnapshot, PuwError>;
}
