use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::sanitize_hostname;

pub const LIGHTSAIL_REGIONS: &[&str] = &["eu-central-1", "eu-west-1"];
pub const DIGITALOCEAN_REGIONS: &[&str] = &["fra1", "lon1"];
pub const INSTANCE_NAME_PREFIX: &str = "r-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan '{plan_id}' targets region '{region}', which no provider serves")]
    UnknownRegion { plan_id: String, region: String },
    #[error("plan id cannot be empty")]
    EmptyId,
    #[error("malformed plan: {0}")]
    Malformed(String),
}

/// The two compute providers a fleet spans, told apart by region name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Lightsail,
    DigitalOcean,
}

/// How a provider's tagged instances are torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// List per region, delete each instance on its own.
    PerInstance,
    /// One delete call filtered by tag.
    BulkByTag,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Lightsail, ProviderKind::DigitalOcean];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lightsail => "lightsail",
            Self::DigitalOcean => "digitalocean",
        }
    }

    pub fn regions(self) -> &'static [&'static str] {
        match self {
            Self::Lightsail => LIGHTSAIL_REGIONS,
            Self::DigitalOcean => DIGITALOCEAN_REGIONS,
        }
    }

    pub fn serves(self, region: &str) -> bool {
        self.regions().contains(&region)
    }

    /// Lightsail snapshots live in one region; DigitalOcean snapshots are global.
    pub fn snapshots_are_regional(self) -> bool {
        matches!(self, Self::Lightsail)
    }

    pub fn teardown_mode(self) -> TeardownMode {
        match self {
            Self::Lightsail => TeardownMode::PerInstance,
            Self::DigitalOcean => TeardownMode::BulkByTag,
        }
    }

    pub fn for_region(region: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.serves(region))
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One VM run. Fields the orchestrator does not interpret are carried in
/// `extra` and serialized back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementPlan {
    pub id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MeasurementPlan {
    pub fn provider(&self) -> Result<ProviderKind, PlanError> {
        if self.id.trim().is_empty() {
            return Err(PlanError::EmptyId);
        }
        ProviderKind::for_region(&self.region).ok_or_else(|| PlanError::UnknownRegion {
            plan_id: self.id.clone(),
            region: self.region.clone(),
        })
    }

    pub fn instance_name(&self) -> String {
        format!("{INSTANCE_NAME_PREFIX}{}", sanitize_hostname(&self.id))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PlanError> {
        serde_json::to_vec(self).map_err(|error| PlanError::Malformed(error.to_string()))
    }
}

/// A plan file holds either one plan or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PlanBatch {
    Many(Vec<MeasurementPlan>),
    One(MeasurementPlan),
}

impl PlanBatch {
    pub fn from_json(bytes: &[u8]) -> Result<Vec<MeasurementPlan>, PlanError> {
        let batch: PlanBatch = serde_json::from_slice(bytes)
            .map_err(|error| PlanError::Malformed(error.to_string()))?;
        Ok(batch.into_plans())
    }

    pub fn into_plans(self) -> Vec<MeasurementPlan> {
        match self {
            Self::Many(plans) => plans,
            Self::One(plan) => vec![plan],
        }
    }
}

/// Route every plan before anything is provisioned; one bad region rejects the batch.
pub fn route_batch(plans: &[MeasurementPlan]) -> Result<Vec<ProviderKind>, PlanError> {
    plans.iter().map(MeasurementPlan::provider).collect()
}
