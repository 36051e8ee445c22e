//! Compute provider boundary: the capability set the fleet needs from a VM host.

use admeasure_core::ProviderKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {message}")]
    Transport {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider} rejected the request: {message}")]
    Api {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider} has no snapshot named '{name}'{}", region_suffix(.region))]
    SnapshotNotFound {
        provider: ProviderKind,
        name: String,
        region: Option<String>,
    },
}

fn region_suffix(region: &Option<String>) -> String {
    region
        .as_deref()
        .map(|region| format!(" in {region}"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub provider: ProviderKind,
    pub region: String,
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub region: String,
    pub name: String,
    pub image_id: String,
    pub user_data: String,
    pub tag: String,
}

pub trait ComputeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Instances in `region` carrying `tag`, in any state.
    fn list_instances(&self, region: &str, tag: &str) -> Result<Vec<InstanceHandle>, ProviderError>;

    /// Deleting an instance that no longer exists succeeds.
    fn delete_instance(&self, instance: &InstanceHandle) -> Result<(), ProviderError>;

    /// One call removing every instance carrying `tag`, for providers that
    /// support it.
    fn delete_tagged(&self, tag: &str) -> Result<(), ProviderError>;

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceHandle, ProviderError>;

    /// Provider image id of the named snapshot. `region` is only consulted
    /// by providers whose snapshots are regional.
    fn resolve_snapshot(&self, region: &str, name: &str) -> Result<String, ProviderError>;
}
