use std::sync::Arc;
use std::time::Duration;

use admeasure_cloud::adapters::compute::CreateInstanceRequest;
use admeasure_cloud::test_helpers::{FakeComputeProvider, InMemoryArtifactStore};
use admeasure_cloud::{
    ArtifactClient, ComputeProvider, Fleet, FleetConfig, FleetError, InstanceHandle,
    ProviderError, WaitOutcome,
};
use admeasure_core::{MeasurementPlan, ProviderKind};
use serde_json::json;

/// Lets a test keep inspecting a fake after handing it to the fleet.
struct Shared(Arc<FakeComputeProvider>);

impl ComputeProvider for Shared {
    fn kind(&self) -> ProviderKind {
        self.0.kind()
    }

    fn list_instances(&self, region: &str, tag: &str) -> Result<Vec<InstanceHandle>, ProviderError> {
        self.0.list_instances(region, tag)
    }

    fn delete_instance(&self, instance: &InstanceHandle) -> Result<(), ProviderError> {
        self.0.delete_instance(instance)
    }

    fn delete_tagged(&self, tag: &str) -> Result<(), ProviderError> {
        self.0.delete_tagged(tag)
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceHandle, ProviderError> {
        self.0.create_instance(request)
    }

    fn resolve_snapshot(&self, region: &str, name: &str) -> Result<String, ProviderError> {
        self.0.resolve_snapshot(region, name)
    }
}

struct Harness {
    lightsail: Arc<FakeComputeProvider>,
    digitalocean: Arc<FakeComputeProvider>,
    fleet: Fleet,
}

fn harness(lightsail: FakeComputeProvider, digitalocean: FakeComputeProvider) -> Harness {
    let lightsail = Arc::new(lightsail);
    let digitalocean = Arc::new(digitalocean);
    let fleet = Fleet::new(
        Box::new(Shared(lightsail.clone())),
        Box::new(Shared(digitalocean.clone())),
        FleetConfig::default(),
    );
    Harness {
        lightsail,
        digitalocean,
        fleet,
    }
}

fn default_harness() -> Harness {
    harness(
        FakeComputeProvider::new(ProviderKind::Lightsail)
            .with_snapshot("admeasure-runner", "admeasure-runner"),
        FakeComputeProvider::new(ProviderKind::DigitalOcean)
            .with_snapshot("admeasure-runner", "4242"),
    )
}

fn plan(id: &str, region: &str) -> MeasurementPlan {
    serde_json::from_value(json!({ "id": id, "region": region, "device": {"name": "desktop"} }))
        .expect("plan")
}

#[test]
fn spawned_runners_boot_the_uploaded_bundle() {
    let h = default_harness();
    let artifacts = ArtifactClient::new(Arc::new(InMemoryArtifactStore::new()));

    h.fleet
        .spawn(&[plan("eval/2024-05-01T10:00:00", "fra1")], &artifacts, false)
        .expect("spawn");

    let created = h.digitalocean.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].image_id, "4242");
    assert_eq!(created[0].tag, "runner");
    assert_eq!(created[0].name, "r-eval-2024-05-01T10-00-00");
    assert!(created[0]
        .user_data
        .contains("curl https://objects.test/admeasure/resources/main.js -o main.js"));
    assert!(h.lightsail.created().is_empty());
}

#[test]
fn concurrent_launches_resolve_the_image_once() {
    let h = harness(
        FakeComputeProvider::new(ProviderKind::Lightsail),
        FakeComputeProvider::new(ProviderKind::DigitalOcean)
            .with_snapshot("admeasure-runner", "4242")
            .with_snapshot_delay(Duration::from_millis(50)),
    );

    std::thread::scope(|scope| {
        for index in 0..8 {
            let fleet = &h.fleet;
            scope.spawn(move || {
                fleet
                    .launch(&plan(&format!("eval/p{index}"), "lon1"), "https://r/main.js")
                    .expect("launch");
            });
        }
    });

    assert_eq!(h.digitalocean.snapshot_lookups(), 1);
    assert_eq!(h.digitalocean.created().len(), 8);
}

#[test]
fn missing_snapshot_fails_the_launch() {
    let h = harness(
        FakeComputeProvider::new(ProviderKind::Lightsail),
        FakeComputeProvider::new(ProviderKind::DigitalOcean),
    );
    let error = h
        .fleet
        .launch(&plan("eval/p", "eu-central-1"), "https://r/main.js")
        .expect_err("no snapshot");
    assert!(matches!(
        error,
        FleetError::Provider(ProviderError::SnapshotNotFound { .. })
    ));
    assert!(h.lightsail.created().is_empty());
}

#[test]
fn delete_by_tag_is_idempotent() {
    let h = default_harness();
    h.lightsail.seed_instance("eu-central-1", "r-a", "runner");
    h.digitalocean.seed_instance("fra1", "r-b", "runner");
    h.digitalocean.seed_instance("lon1", "r-c", "runner");

    let first = h.fleet.delete_by_tag("runner");
    assert!(first.is_clean());
    assert_eq!(first.deleted.len(), 3);
    assert_eq!(h.digitalocean.bulk_deletes(), 1);

    let second = h.fleet.delete_by_tag("runner");
    assert!(second.is_clean());
    assert!(second.deleted.is_empty());
    assert_eq!(h.digitalocean.bulk_deletes(), 1);
    assert_eq!(h.fleet.count_alive("runner").expect("count"), 0);
}

#[test]
fn teardown_tolerates_instances_that_exit_between_listing_and_deletion() {
    let h = default_harness();
    h.lightsail.seed_instance("eu-central-1", "r-done", "runner");
    h.lightsail.seed_instance("eu-west-1", "r-busy", "runner");
    h.lightsail.vanish_after_listing("r-done");
    h.digitalocean.seed_instance("fra1", "r-b", "runner");

    let report = h.fleet.delete_by_tag("runner");
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.deleted.len(), 3);
    assert_eq!(h.fleet.count_alive("runner").expect("count"), 0);
}

#[test]
fn other_tags_survive_teardown() {
    let h = default_harness();
    h.digitalocean.seed_instance("fra1", "db", "database");
    h.lightsail.seed_instance("eu-west-1", "r-a", "runner");

    h.fleet.delete_by_tag("runner");
    assert_eq!(h.digitalocean.alive().len(), 1);
    assert!(h.lightsail.alive().is_empty());
}

#[test]
fn wait_reports_drained_once_instances_self_destruct() {
    let h = default_harness();
    h.lightsail.seed_instance("eu-central-1", "r-a", "runner");
    // Each poll lists both Lightsail regions; the third listing drains them.
    h.lightsail.drain_after_listings(3);

    let outcome = h
        .fleet
        .wait_complete("runner", Duration::from_secs(5), Duration::from_millis(10))
        .expect("wait");
    assert!(matches!(outcome, WaitOutcome::Drained { .. }));
    assert!(h.lightsail.deleted().is_empty());
}

#[test]
fn wait_force_deletes_after_the_timeout() {
    let h = default_harness();
    h.lightsail.seed_instance("eu-central-1", "r-a", "runner");
    h.digitalocean.seed_instance("fra1", "r-b", "runner");

    let outcome = h
        .fleet
        .wait_complete("runner", Duration::from_millis(30), Duration::from_millis(10))
        .expect("wait");
    match outcome {
        WaitOutcome::TimedOut { alive, teardown } => {
            assert_eq!(alive, 2);
            assert!(teardown.is_clean());
            assert_eq!(teardown.deleted.len(), 2);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(h.fleet.count_alive("runner").expect("count"), 0);
}

#[test]
fn wait_fails_closed_when_listing_breaks() {
    let h = default_harness();
    h.digitalocean.seed_instance("fra1", "r-b", "runner");
    h.digitalocean.fail_listings(ProviderError::Transport {
        provider: ProviderKind::DigitalOcean,
        message: "timed out".to_string(),
    });

    let error = h
        .fleet
        .wait_complete("runner", Duration::from_secs(1), Duration::from_millis(10))
        .expect_err("listing failure");
    assert!(matches!(error, FleetError::Provider(ProviderError::Transport { .. })));
    assert_eq!(h.digitalocean.alive().len(), 1);
}
