//! Runner VM fleet across both compute providers.
//!
//! Plans are routed to a provider by region before anything is created.
//! Teardown selects instances by tag only; it never consults plan state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use admeasure_core::boot_script::build_boot_script;
use admeasure_core::plan::{route_batch, TeardownMode};
use admeasure_core::{MeasurementPlan, PlanError, ProviderKind};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;

use super::artifacts::ArtifactClient;
use crate::adapters::compute::{ComputeProvider, CreateInstanceRequest, InstanceHandle, ProviderError};
use crate::adapters::object_store::StoreError;
use crate::config::FleetConfig;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Precondition(#[from] PlanError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to resolve runner resource url: {0}")]
    Resource(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub provider: ProviderKind,
    pub region: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<InstanceHandle>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: TeardownReport) {
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, provider: ProviderKind, region: Option<&str>, message: impl Into<String>) {
        self.failures.push(TeardownFailure {
            provider,
            region: region.map(str::to_string),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No tagged instance was left alive.
    Drained { elapsed: Duration },
    /// Instances outlived the timeout and were deleted.
    TimedOut {
        alive: usize,
        teardown: TeardownReport,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImageKey {
    provider: ProviderKind,
    name: String,
    region: Option<String>,
}

/// Snapshot name to image id, resolved at most once per key even when
/// several launches ask at the same time. Failed lookups are retried.
#[derive(Debug, Default)]
struct ImageIdCache {
    entries: Mutex<HashMap<ImageKey, Arc<OnceCell<String>>>>,
}

impl ImageIdCache {
    fn resolve(
        &self,
        provider: &dyn ComputeProvider,
        region: &str,
        name: &str,
    ) -> Result<String, ProviderError> {
        let kind = provider.kind();
        let key = ImageKey {
            provider: kind,
            name: name.to_string(),
            region: kind.snapshots_are_regional().then(|| region.to_string()),
        };
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key).or_default())
        };
        cell.get_or_try_init(|| {
            let started_at = Instant::now();
            let image_id = provider.resolve_snapshot(region, name)?;
            tracing::info!(
                component = "fleet",
                event = "image_resolved",
                provider = %kind,
                region,
                name,
                image_id = image_id.as_str(),
                duration_ms = started_at.elapsed().as_millis() as u64,
            );
            Ok(image_id)
        })
        .cloned()
    }
}

pub struct Fleet {
    lightsail: Box<dyn ComputeProvider>,
    digitalocean: Box<dyn ComputeProvider>,
    config: FleetConfig,
    images: ImageIdCache,
}

impl Fleet {
    pub fn new(
        lightsail: Box<dyn ComputeProvider>,
        digitalocean: Box<dyn ComputeProvider>,
        config: FleetConfig,
    ) -> Self {
        Self {
            lightsail,
            digitalocean,
            config,
            images: ImageIdCache::default(),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    fn provider(&self, kind: ProviderKind) -> &dyn ComputeProvider {
        match kind {
            ProviderKind::Lightsail => self.lightsail.as_ref(),
            ProviderKind::DigitalOcean => self.digitalocean.as_ref(),
        }
    }

    fn providers(&self) -> [&dyn ComputeProvider; 2] {
        [self.lightsail.as_ref(), self.digitalocean.as_ref()]
    }

    /// Create one runner for `plan`, booting the runner bundle at `resource_url`.
    pub fn launch(&self, plan: &MeasurementPlan, resource_url: &str) -> Result<InstanceHandle, FleetError> {
        let kind = plan.provider()?;
        let provider = self.provider(kind);
        let image_id = self
            .images
            .resolve(provider, &plan.region, &self.config.image_name)?;
        let request = CreateInstanceRequest {
            region: plan.region.clone(),
            name: plan.instance_name(),
            image_id,
            user_data: build_boot_script(plan, resource_url)?,
            tag: self.config.tag.clone(),
        };
        let instance = provider.create_instance(&request)?;
        tracing::info!(
            component = "fleet",
            event = "instance_created",
            provider = %kind,
            region = instance.region.as_str(),
            name = instance.name.as_str(),
            plan_id = plan.id.as_str(),
        );
        Ok(instance)
    }

    /// Launch one runner per plan. Every plan is routed first, so a single
    /// unknown region rejects the batch before any instance exists.
    pub fn spawn(
        &self,
        plans: &[MeasurementPlan],
        artifacts: &ArtifactClient,
        show_progress: bool,
    ) -> Result<Vec<InstanceHandle>, FleetError> {
        route_batch(plans)?;
        if plans.is_empty() {
            return Ok(Vec::new());
        }
        let resource_url = artifacts.resource_url(&self.config.resource_name)?;

        let progress = if show_progress {
            let bar = ProgressBar::new(plans.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let mut instances = Vec::with_capacity(plans.len());
        for plan in plans {
            progress.set_message(plan.id.clone());
            instances.push(self.launch(plan, &resource_url)?);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(instances)
    }

    /// Delete every instance carrying `tag` on both providers concurrently.
    ///
    /// Failures are collected per provider branch; a listing failure stops
    /// only the branch it happened in.
    pub fn delete_by_tag(&self, tag: &str) -> TeardownReport {
        let started_at = Instant::now();
        let mut report = TeardownReport::default();
        std::thread::scope(|scope| {
            let branches: Vec<_> = self
                .providers()
                .into_iter()
                .map(|provider| {
                    let handle = scope.spawn(move || match provider.kind().teardown_mode() {
                        TeardownMode::PerInstance => teardown_per_instance(provider, tag),
                        TeardownMode::BulkByTag => teardown_bulk(provider, tag),
                    });
                    (provider.kind(), handle)
                })
                .collect();
            for (kind, handle) in branches {
                match handle.join() {
                    Ok(branch) => report.absorb(branch),
                    Err(_) => report.fail(kind, None, "teardown thread panicked"),
                }
            }
        });

        if report.is_clean() {
            tracing::info!(
                component = "fleet",
                event = "teardown_completed",
                tag,
                deleted = report.deleted.len(),
                duration_ms = started_at.elapsed().as_millis() as u64,
            );
        } else {
            tracing::error!(
                component = "fleet",
                event = "teardown_incomplete",
                tag,
                deleted = report.deleted.len(),
                failures = report.failures.len(),
                duration_ms = started_at.elapsed().as_millis() as u64,
            );
        }
        report
    }

    /// Tagged instances still alive across every region of both providers.
    pub fn count_alive(&self, tag: &str) -> Result<usize, ProviderError> {
        let mut alive = 0;
        for provider in self.providers() {
            for &region in provider.kind().regions() {
                alive += provider.list_instances(region, tag)?.len();
            }
        }
        Ok(alive)
    }

    /// Poll until no tagged instance is alive. Once `timeout` has elapsed with
    /// instances remaining, they are force-deleted. Listing errors end the
    /// wait with an error; completion is only reported after seeing zero.
    pub fn wait_complete(
        &self,
        tag: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<WaitOutcome, FleetError> {
        let started_at = Instant::now();
        loop {
            let alive = self.count_alive(tag)?;
            let elapsed = started_at.elapsed();
            if alive == 0 {
                tracing::info!(
                    component = "fleet",
                    event = "fleet_drained",
                    tag,
                    elapsed_secs = elapsed.as_secs(),
                );
                return Ok(WaitOutcome::Drained { elapsed });
            }
            if elapsed >= timeout {
                tracing::warn!(
                    component = "fleet",
                    event = "wait_timed_out",
                    tag,
                    alive,
                    "timeout reached, deleting remaining instances"
                );
                let teardown = self.delete_by_tag(tag);
                return Ok(WaitOutcome::TimedOut { alive, teardown });
            }
            tracing::info!(
                component = "fleet",
                event = "instances_alive",
                tag,
                alive,
                elapsed_secs = elapsed.as_secs(),
            );
            std::thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }
}

fn teardown_per_instance(provider: &dyn ComputeProvider, tag: &str) -> TeardownReport {
    let kind = provider.kind();
    let mut report = TeardownReport::default();
    let mut listed = Vec::new();
    for &region in kind.regions() {
        match provider.list_instances(region, tag) {
            Ok(instances) => listed.extend(instances),
            Err(error) => {
                report.fail(kind, Some(region), error.to_string());
                return report;
            }
        }
    }
    std::thread::scope(|scope| {
        let deletions: Vec<_> = listed
            .into_iter()
            .map(|instance| {
                scope.spawn(move || {
                    let result = provider.delete_instance(&instance);
                    (instance, result)
                })
            })
            .collect();
        for deletion in deletions {
            match deletion.join() {
                Ok((instance, Ok(()))) => report.deleted.push(instance),
                Ok((instance, Err(error))) => {
                    report.fail(kind, Some(&instance.region), error.to_string())
                }
                Err(_) => report.fail(kind, None, "delete thread panicked"),
            }
        }
    });
    report
}

fn teardown_bulk(provider: &dyn ComputeProvider, tag: &str) -> TeardownReport {
    let kind = provider.kind();
    let mut report = TeardownReport::default();
    let mut listed = Vec::new();
    for &region in kind.regions() {
        match provider.list_instances(region, tag) {
            Ok(instances) => listed.extend(instances),
            Err(error) => {
                report.fail(kind, Some(region), error.to_string());
                return report;
            }
        }
    }
    if listed.is_empty() {
        return report;
    }
    match provider.delete_tagged(tag) {
        Ok(()) => report.deleted = listed,
        Err(error) => report.fail(kind, None, error.to_string()),
    }
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use admeasure_core::ProviderKind;
    use serde_json::json;

    use super::*;
    use crate::test_helpers::{FakeComputeProvider, InMemoryArtifactStore};

    fn plan(id: &str, region: &str) -> MeasurementPlan {
        serde_json::from_value(json!({ "id": id, "region": region })).expect("plan")
    }

    fn fleet_with(lightsail: FakeComputeProvider, digitalocean: FakeComputeProvider) -> Fleet {
        Fleet::new(
            Box::new(lightsail),
            Box::new(digitalocean),
            FleetConfig::default(),
        )
    }

    fn fakes() -> (FakeComputeProvider, FakeComputeProvider) {
        (
            FakeComputeProvider::new(ProviderKind::Lightsail)
                .with_snapshot("admeasure-runner", "admeasure-runner"),
            FakeComputeProvider::new(ProviderKind::DigitalOcean)
                .with_snapshot("admeasure-runner", "4242"),
        )
    }

    #[test]
    fn image_ids_are_cached_per_region_only_where_snapshots_are_regional() {
        let cache = ImageIdCache::default();
        let (lightsail, digitalocean) = fakes();

        cache.resolve(&lightsail, "eu-central-1", "admeasure-runner").expect("resolve");
        cache.resolve(&lightsail, "eu-central-1", "admeasure-runner").expect("resolve");
        cache.resolve(&lightsail, "eu-west-1", "admeasure-runner").expect("resolve");
        assert_eq!(lightsail.snapshot_lookups(), 2);

        cache.resolve(&digitalocean, "fra1", "admeasure-runner").expect("resolve");
        let id = cache.resolve(&digitalocean, "lon1", "admeasure-runner").expect("resolve");
        assert_eq!(id, "4242");
        assert_eq!(digitalocean.snapshot_lookups(), 1);
    }

    #[test]
    fn failed_image_lookups_are_not_cached() {
        let cache = ImageIdCache::default();
        let provider = FakeComputeProvider::new(ProviderKind::DigitalOcean);

        let error = cache
            .resolve(&provider, "fra1", "admeasure-runner")
            .expect_err("no snapshot yet");
        assert!(matches!(error, ProviderError::SnapshotNotFound { .. }));
        let _ = cache.resolve(&provider, "fra1", "admeasure-runner");
        assert_eq!(provider.snapshot_lookups(), 2);
    }

    #[test]
    fn spawn_rejects_the_whole_batch_on_an_unknown_region() {
        let (lightsail, digitalocean) = fakes();
        let fleet = fleet_with(lightsail, digitalocean);
        let artifacts = ArtifactClient::new(Arc::new(InMemoryArtifactStore::new()));

        let error = fleet
            .spawn(
                &[plan("eval/a", "fra1"), plan("eval/b", "mars-1")],
                &artifacts,
                false,
            )
            .expect_err("unknown region");
        assert!(matches!(
            error,
            FleetError::Precondition(PlanError::UnknownRegion { ref region, .. }) if region == "mars-1"
        ));
        assert_eq!(fleet.count_alive("runner").expect("count"), 0);
    }

    #[test]
    fn spawn_creates_one_tagged_instance_per_plan() {
        let (lightsail, digitalocean) = fakes();
        let fleet = fleet_with(lightsail, digitalocean);
        let artifacts = ArtifactClient::new(Arc::new(InMemoryArtifactStore::new()));

        let instances = fleet
            .spawn(
                &[plan("eval/a", "eu-west-1"), plan("eval/b", "lon1")],
                &artifacts,
                false,
            )
            .expect("spawn");

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].provider, ProviderKind::Lightsail);
        assert_eq!(instances[0].name, "r-eval-a");
        assert_eq!(instances[1].provider, ProviderKind::DigitalOcean);
        assert_eq!(instances[1].region, "lon1");
        assert_eq!(fleet.count_alive("runner").expect("count"), 2);
    }

    #[test]
    fn spawning_nothing_touches_no_provider() {
        let (lightsail, digitalocean) = fakes();
        let fleet = fleet_with(lightsail, digitalocean);
        let artifacts = ArtifactClient::new(Arc::new(InMemoryArtifactStore::new()));

        let instances = fleet.spawn(&[], &artifacts, false).expect("spawn");
        assert!(instances.is_empty());
    }

    #[test]
    fn teardown_with_nothing_alive_makes_no_bulk_call() {
        let (_, digitalocean) = fakes();
        let report = teardown_bulk(&digitalocean, "runner");
        assert!(report.is_clean());
        assert!(report.deleted.is_empty());
        assert_eq!(digitalocean.bulk_deletes(), 0);
    }

    #[test]
    fn per_instance_teardown_deletes_only_tagged_instances() {
        let (lightsail, _) = fakes();
        lightsail.seed_instance("eu-central-1", "r-a", "runner");
        lightsail.seed_instance("eu-west-1", "r-b", "runner");
        lightsail.seed_instance("eu-west-1", "keep-me", "other");

        let report = teardown_per_instance(&lightsail, "runner");
        assert!(report.is_clean());
        assert_eq!(report.deleted.len(), 2);
        let alive = lightsail.alive();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].name, "keep-me");
    }

    #[test]
    fn listing_failure_stops_only_its_branch() {
        let (lightsail, digitalocean) = fakes();
        lightsail.fail_listings(ProviderError::Transport {
            provider: ProviderKind::Lightsail,
            message: "connection reset".to_string(),
        });
        digitalocean.seed_instance("fra1", "r-x", "runner");
        let fleet = fleet_with(lightsail, digitalocean);

        let report = fleet.delete_by_tag("runner");
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].provider, ProviderKind::Lightsail);
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].name, "r-x");
    }

    #[test]
    fn per_instance_teardown_lists_every_region_before_deleting() {
        let (lightsail, _) = fakes();
        lightsail.seed_instance("eu-central-1", "r-a", "runner");
        lightsail.seed_instance("eu-west-1", "r-b", "runner");
        lightsail.fail_listings_in(
            "eu-west-1",
            ProviderError::Transport {
                provider: ProviderKind::Lightsail,
                message: "throttled".to_string(),
            },
        );

        let report = teardown_per_instance(&lightsail, "runner");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].region.as_deref(), Some("eu-west-1"));
        assert!(report.deleted.is_empty());
        assert!(lightsail.deleted().is_empty());
        assert_eq!(lightsail.alive().len(), 2);
    }

    #[test]
    fn instances_gone_before_deletion_still_count_as_deleted() {
        let (lightsail, _) = fakes();
        lightsail.seed_instance("eu-central-1", "r-a", "runner");
        lightsail.seed_instance("eu-west-1", "r-gone", "runner");
        lightsail.vanish_after_listing("r-gone");

        let report = teardown_per_instance(&lightsail, "runner");
        assert!(report.is_clean());
        assert_eq!(report.deleted.len(), 2);
        assert!(lightsail.alive().is_empty());
    }

    #[test]
    fn failed_instance_deletions_are_reported() {
        let (lightsail, _) = fakes();
        lightsail.seed_instance("eu-central-1", "r-stuck", "runner");
        lightsail.seed_instance("eu-central-1", "r-ok", "runner");
        lightsail.refuse_delete_of("r-stuck");

        let report = teardown_per_instance(&lightsail, "runner");
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].region.as_deref(), Some("eu-central-1"));
    }
}
