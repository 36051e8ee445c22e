//! Cloud adapters and handlers for measurement campaigns.
//!
//! Adapter traits (`adapters`) are synchronous and narrow so handlers can be
//! exercised against in-memory fakes; the AWS and DigitalOcean
//! implementations live beside them. Handlers own the campaign workflows:
//! artifact access, cached bulk downloads, log collection and the VM fleet.

pub mod adapters;
pub mod config;
pub mod handlers;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use adapters::compute::{ComputeProvider, InstanceHandle, ProviderError};
pub use adapters::object_store::{ArtifactStore, StoreError, StoredObject};
pub use config::{FleetConfig, StoreConfig};
pub use handlers::artifacts::ArtifactClient;
pub use handlers::fetch::{fetch_all, FetchError, FetchOptions, FetchOutcome, FetchStats};
pub use handlers::fleet::{Fleet, FleetError, TeardownReport, WaitOutcome};
