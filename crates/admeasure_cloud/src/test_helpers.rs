//! In-memory stand-ins for the object store and the compute providers.
//!
//! They implement the adapter traits with the same observable contract as
//! the real backends (pagination, absent keys, idempotent deletes) and record
//! calls so tests can assert on remote traffic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use admeasure_core::ProviderKind;

use crate::adapters::compute::{ComputeProvider, CreateInstanceRequest, InstanceHandle, ProviderError};
use crate::adapters::object_store::{ArtifactStore, KeyPage, PrefixPage, StoreError, StoredObject};

pub const FAKE_STORE_URL: &str = "https://objects.test/admeasure";

pub struct InMemoryArtifactStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    public: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeSet<String>>,
    page_size: usize,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    delete_batches: Mutex<Vec<usize>>,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::with_page_size(1000)
    }
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            public: Mutex::new(BTreeSet::new()),
            failing: Mutex::new(BTreeSet::new()),
            page_size: page_size.max(1),
            get_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            delete_batches: Mutex::new(Vec::new()),
        }
    }

    pub fn seed(&self, key: &str, body: &[u8]) {
        self.seed_encoded(key, body, None);
    }

    pub fn seed_encoded(&self, key: &str, body: &[u8], content_encoding: Option<&str>) {
        self.objects.lock().expect("poisoned mutex").insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                content_encoding: content_encoding.map(str::to_string),
            },
        );
    }

    /// Make every read of `key` fail with a transport error.
    pub fn fail_reads_of(&self, key: &str) {
        self.failing
            .lock()
            .expect("poisoned mutex")
            .insert(key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("poisoned mutex")
            .keys()
            .cloned()
            .collect()
    }

    pub fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("poisoned mutex")
            .get(key)
            .map(|object| object.body.clone())
    }

    pub fn is_public(&self, key: &str) -> bool {
        self.public.lock().expect("poisoned mutex").contains(key)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_batches(&self) -> Vec<usize> {
        self.delete_batches.lock().expect("poisoned mutex").clone()
    }

    fn page<T: Clone>(&self, items: &[T], continuation: Option<&str>, position: impl Fn(&T) -> &str) -> (Vec<T>, Option<String>) {
        let start = continuation
            .map(|token| items.partition_point(|item| position(item) <= token))
            .unwrap_or(0);
        let end = (start + self.page_size).min(items.len());
        let page = items[start..end].to_vec();
        let next = (end < items.len())
            .then(|| page.last().map(|item| position(item).to_string()))
            .flatten();
        (page, next)
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn get_object(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().expect("poisoned mutex").contains(key) {
            return Err(StoreError::Transport(format!("injected failure reading {key}")));
        }
        self.objects
            .lock()
            .expect("poisoned mutex")
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn put_object(&self, key: &str, body: &[u8], public: bool) -> Result<(), StoreError> {
        self.seed(key, body);
        if public {
            self.public
                .lock()
                .expect("poisoned mutex")
                .insert(key.to_string());
        }
        Ok(())
    }

    fn list_keys(&self, prefix: &str, continuation: Option<&str>) -> Result<KeyPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        let (keys, next) = self.page(&keys, continuation, String::as_str);
        Ok(KeyPage { keys, next })
    }

    fn list_prefixes(
        &self,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<PrefixPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let prefixes: Vec<String> = self
            .keys()
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                let end = rest.find(delimiter)? + delimiter.len();
                Some(format!("{prefix}{}", &rest[..end]))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (prefixes, next) = self.page(&prefixes, continuation, String::as_str);
        Ok(PrefixPage { prefixes, next })
    }

    fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        self.delete_batches
            .lock()
            .expect("poisoned mutex")
            .push(keys.len());
        let mut objects = self.objects.lock().expect("poisoned mutex");
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn presigned_get_url(&self, key: &str) -> Result<String, StoreError> {
        Ok(format!(
            "{FAKE_STORE_URL}/{key}?X-Amz-Expires=3600&X-Amz-Signature=deadbeef"
        ))
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    handle: InstanceHandle,
    tag: String,
}

/// Compute provider whose instances live in memory.
pub struct FakeComputeProvider {
    kind: ProviderKind,
    alive: Mutex<Vec<FakeInstance>>,
    snapshots: Mutex<HashMap<String, String>>,
    snapshot_delay: Duration,
    snapshot_lookups: AtomicUsize,
    created: Mutex<Vec<CreateInstanceRequest>>,
    deleted: Mutex<Vec<InstanceHandle>>,
    bulk_deletes: AtomicUsize,
    list_calls: AtomicUsize,
    drain_after_listings: Mutex<Option<usize>>,
    listing_error: Mutex<Option<ProviderError>>,
    region_listing_errors: Mutex<HashMap<String, ProviderError>>,
    undeletable: Mutex<BTreeSet<String>>,
    vanishing: Mutex<BTreeSet<String>>,
}

impl FakeComputeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            alive: Mutex::new(Vec::new()),
            snapshots: Mutex::new(HashMap::new()),
            snapshot_delay: Duration::ZERO,
            snapshot_lookups: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            bulk_deletes: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            drain_after_listings: Mutex::new(None),
            listing_error: Mutex::new(None),
            region_listing_errors: Mutex::new(HashMap::new()),
            undeletable: Mutex::new(BTreeSet::new()),
            vanishing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_snapshot(self, name: &str, image_id: &str) -> Self {
        self.snapshots
            .lock()
            .expect("poisoned mutex")
            .insert(name.to_string(), image_id.to_string());
        self
    }

    /// Slow snapshot lookups down so concurrent launches overlap.
    pub fn with_snapshot_delay(mut self, delay: Duration) -> Self {
        self.snapshot_delay = delay;
        self
    }

    pub fn seed_instance(&self, region: &str, name: &str, tag: &str) -> InstanceHandle {
        let handle = InstanceHandle {
            provider: self.kind,
            region: region.to_string(),
            name: name.to_string(),
            id: format!("{}-{name}", self.kind),
        };
        self.alive.lock().expect("poisoned mutex").push(FakeInstance {
            handle: handle.clone(),
            tag: tag.to_string(),
        });
        handle
    }

    /// Instances disappear on their own once `count` listings have happened.
    pub fn drain_after_listings(&self, count: usize) {
        *self.drain_after_listings.lock().expect("poisoned mutex") = Some(count);
    }

    pub fn fail_listings(&self, error: ProviderError) {
        *self.listing_error.lock().expect("poisoned mutex") = Some(error);
    }

    pub fn fail_listings_in(&self, region: &str, error: ProviderError) {
        self.region_listing_errors
            .lock()
            .expect("poisoned mutex")
            .insert(region.to_string(), error);
    }

    /// The named instance still shows up in the next listing but is gone by
    /// the time anyone tries to delete it.
    pub fn vanish_after_listing(&self, name: &str) {
        self.vanishing
            .lock()
            .expect("poisoned mutex")
            .insert(name.to_string());
    }

    pub fn refuse_delete_of(&self, name: &str) {
        self.undeletable
            .lock()
            .expect("poisoned mutex")
            .insert(name.to_string());
    }

    pub fn alive(&self) -> Vec<InstanceHandle> {
        self.alive
            .lock()
            .expect("poisoned mutex")
            .iter()
            .map(|instance| instance.handle.clone())
            .collect()
    }

    pub fn created(&self) -> Vec<CreateInstanceRequest> {
        self.created.lock().expect("poisoned mutex").clone()
    }

    pub fn deleted(&self) -> Vec<InstanceHandle> {
        self.deleted.lock().expect("poisoned mutex").clone()
    }

    pub fn snapshot_lookups(&self) -> usize {
        self.snapshot_lookups.load(Ordering::SeqCst)
    }

    pub fn bulk_deletes(&self) -> usize {
        self.bulk_deletes.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl ComputeProvider for FakeComputeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn list_instances(&self, region: &str, tag: &str) -> Result<Vec<InstanceHandle>, ProviderError> {
        let calls = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.listing_error.lock().expect("poisoned mutex").clone() {
            return Err(error);
        }
        if let Some(error) = self
            .region_listing_errors
            .lock()
            .expect("poisoned mutex")
            .get(region)
        {
            return Err(error.clone());
        }
        let mut alive = self.alive.lock().expect("poisoned mutex");
        if let Some(threshold) = *self.drain_after_listings.lock().expect("poisoned mutex") {
            if calls >= threshold {
                alive.clear();
            }
        }
        let listed = alive
            .iter()
            .filter(|instance| instance.handle.region == region && instance.tag == tag)
            .map(|instance| instance.handle.clone())
            .collect();
        let vanishing = self.vanishing.lock().expect("poisoned mutex");
        alive.retain(|instance| !vanishing.contains(&instance.handle.name));
        Ok(listed)
    }

    fn delete_instance(&self, instance: &InstanceHandle) -> Result<(), ProviderError> {
        if self
            .undeletable
            .lock()
            .expect("poisoned mutex")
            .contains(&instance.name)
        {
            return Err(ProviderError::Api {
                provider: self.kind,
                message: format!("refusing to delete {}", instance.name),
            });
        }
        self.alive
            .lock()
            .expect("poisoned mutex")
            .retain(|candidate| candidate.handle != *instance);
        self.deleted
            .lock()
            .expect("poisoned mutex")
            .push(instance.clone());
        Ok(())
    }

    fn delete_tagged(&self, tag: &str) -> Result<(), ProviderError> {
        self.bulk_deletes.fetch_add(1, Ordering::SeqCst);
        let mut alive = self.alive.lock().expect("poisoned mutex");
        let (removed, kept): (Vec<_>, Vec<_>) =
            alive.drain(..).partition(|instance| instance.tag == tag);
        *alive = kept;
        self.deleted
            .lock()
            .expect("poisoned mutex")
            .extend(removed.into_iter().map(|instance| instance.handle));
        Ok(())
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceHandle, ProviderError> {
        self.created
            .lock()
            .expect("poisoned mutex")
            .push(request.clone());
        Ok(self.seed_instance(&request.region, &request.name, &request.tag))
    }

    fn resolve_snapshot(&self, _region: &str, name: &str) -> Result<String, ProviderError> {
        self.snapshot_lookups.fetch_add(1, Ordering::SeqCst);
        if !self.snapshot_delay.is_zero() {
            std::thread::sleep(self.snapshot_delay);
        }
        self.snapshots
            .lock()
            .expect("poisoned mutex")
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::SnapshotNotFound {
                provider: self.kind,
                name: name.to_string(),
                region: None,
            })
    }
}
