//! Defaults and environment overrides for the object store and the fleet.

use std::time::Duration;

use admeasure_core::storage_keys::RUNNER_RESOURCE;

pub const DEFAULT_BUCKET: &str = "admeasure";
pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.eu-central-1.amazonaws.com";
pub const DEFAULT_S3_REGION: &str = "eu-central-1";
pub const DEFAULT_AWS_PROFILE: &str = "admeasure";
pub const DEFAULT_FLEET_TAG: &str = "runner";
pub const DEFAULT_RUNNER_IMAGE: &str = "admeasure-runner";
pub const DEFAULT_DIGITALOCEAN_API: &str = "https://api.digitalocean.com";
pub const DEFAULT_DIGITALOCEAN_SIZE: &str = "s-1vcpu-1gb";
pub const DEFAULT_DIGITALOCEAN_SSH_KEY: &str = "95:42:f6:37:ad:00:ec:40:96:1e:df:cd:e6:12:69:83";
pub const DEFAULT_LIGHTSAIL_BUNDLE: &str = "micro_2_0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub profile: Option<String>,
    /// Lifetime of presigned URLs before the query string is stripped.
    pub presign_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            endpoint: DEFAULT_S3_ENDPOINT.to_string(),
            region: DEFAULT_S3_REGION.to_string(),
            profile: Some(DEFAULT_AWS_PROFILE.to_string()),
            presign_ttl: Duration::from_secs(3600),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket: env_or("ADMEASURE_BUCKET", defaults.bucket),
            endpoint: env_or("ADMEASURE_S3_ENDPOINT", defaults.endpoint),
            region: env_or("ADMEASURE_S3_REGION", defaults.region),
            profile: match std::env::var("ADMEASURE_AWS_PROFILE") {
                Ok(value) if value.trim().is_empty() => None,
                Ok(value) => Some(value),
                Err(_) => defaults.profile,
            },
            presign_ttl: defaults.presign_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    /// Tag every runner is created with; teardown and waiting select on it.
    pub tag: String,
    /// Snapshot name the runners boot from, on both providers.
    pub image_name: String,
    /// Runner bundle under `resources/`, fetched by the boot script.
    pub resource_name: String,
    pub digitalocean_size: String,
    pub digitalocean_ssh_keys: Vec<String>,
    pub lightsail_bundle: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            tag: DEFAULT_FLEET_TAG.to_string(),
            image_name: DEFAULT_RUNNER_IMAGE.to_string(),
            resource_name: RUNNER_RESOURCE.to_string(),
            digitalocean_size: DEFAULT_DIGITALOCEAN_SIZE.to_string(),
            digitalocean_ssh_keys: vec![DEFAULT_DIGITALOCEAN_SSH_KEY.to_string()],
            lightsail_bundle: DEFAULT_LIGHTSAIL_BUNDLE.to_string(),
        }
    }
}

impl FleetConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tag: env_or("ADMEASURE_FLEET_TAG", defaults.tag),
            image_name: env_or("ADMEASURE_RUNNER_IMAGE", defaults.image_name),
            resource_name: env_or("ADMEASURE_RUNNER_RESOURCE", defaults.resource_name),
            digitalocean_size: env_or("ADMEASURE_DO_SIZE", defaults.digitalocean_size),
            digitalocean_ssh_keys: std::env::var("ADMEASURE_DO_SSH_KEYS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|key| !key.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.digitalocean_ssh_keys),
            lightsail_bundle: env_or("ADMEASURE_LIGHTSAIL_BUNDLE", defaults.lightsail_bundle),
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_campaign_infrastructure() {
        let store = StoreConfig::default();
        assert_eq!(store.bucket, "admeasure");
        assert_eq!(store.endpoint, "https://s3.eu-central-1.amazonaws.com");

        let fleet = FleetConfig::default();
        assert_eq!(fleet.tag, "runner");
        assert_eq!(fleet.image_name, "admeasure-runner");
        assert_eq!(fleet.resource_name, "main.js");
        assert_eq!(fleet.lightsail_bundle, "micro_2_0");
    }

    #[test]
    fn blank_environment_values_fall_back_to_defaults() {
        assert_eq!(
            env_or("ADMEASURE_TEST_UNSET_VARIABLE", "fallback".to_string()),
            "fallback"
        );
    }
}
