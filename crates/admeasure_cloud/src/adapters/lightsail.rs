//! AWS Lightsail [`ComputeProvider`].
//!
//! Lightsail addresses instances and snapshots by name within a region, and
//! tags are matched by key only. One SDK client is kept per served region.

use std::collections::BTreeMap;
use std::future::Future;

use admeasure_core::plan::LIGHTSAIL_REGIONS;
use admeasure_core::ProviderKind;
use aws_sdk_lightsail::error::DisplayErrorContext;
use aws_sdk_lightsail::types::Tag;
use aws_sdk_lightsail::Client;
use tokio::runtime::Handle;

use super::compute::{ComputeProvider, CreateInstanceRequest, InstanceHandle, ProviderError};

#[derive(Debug, Clone)]
pub struct LightsailProvider {
    clients: BTreeMap<String, Client>,
    bundle_id: String,
    runtime: Handle,
}

impl LightsailProvider {
    pub fn new(clients: BTreeMap<String, Client>, bundle_id: impl Into<String>, runtime: Handle) -> Self {
        Self {
            clients,
            bundle_id: bundle_id.into(),
            runtime,
        }
    }

    pub fn connect(profile: Option<&str>, bundle_id: impl Into<String>, runtime: Handle) -> Self {
        let clients = runtime.block_on(async {
            let mut clients = BTreeMap::new();
            for region in LIGHTSAIL_REGIONS {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(aws_config::Region::new(region.to_string()));
                if let Some(profile) = profile {
                    loader = loader.profile_name(profile);
                }
                let shared = loader.load().await;
                clients.insert(region.to_string(), Client::new(&shared));
            }
            clients
        });
        Self::new(clients, bundle_id, runtime)
    }

    fn client(&self, region: &str) -> Result<&Client, ProviderError> {
        self.clients.get(region).ok_or_else(|| ProviderError::Api {
            provider: ProviderKind::Lightsail,
            message: format!("no client configured for region '{region}'"),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl ComputeProvider for LightsailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Lightsail
    }

    fn list_instances(&self, region: &str, tag: &str) -> Result<Vec<InstanceHandle>, ProviderError> {
        let client = self.client(region)?;
        self.block_on(async {
            let mut instances = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let output = client
                    .get_instances()
                    .set_page_token(page_token.take())
                    .send()
                    .await
                    .map_err(|error| transport(format!("list instances in {region}"), DisplayErrorContext(&error)))?;
                instances.extend(
                    output
                        .instances()
                        .iter()
                        .filter(|instance| {
                            instance.tags().iter().any(|candidate| candidate.key() == Some(tag))
                        })
                        .filter_map(|instance| instance.name())
                        .map(|name| InstanceHandle {
                            provider: ProviderKind::Lightsail,
                            region: region.to_string(),
                            name: name.to_string(),
                            id: name.to_string(),
                        }),
                );
                match output.next_page_token() {
                    Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                    _ => break,
                }
            }
            Ok::<_, ProviderError>(instances)
        })
    }

    fn delete_instance(&self, instance: &InstanceHandle) -> Result<(), ProviderError> {
        let client = self.client(&instance.region)?;
        self.block_on(async {
            match client
                .delete_instance()
                .instance_name(&instance.name)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(error)
                    if error
                        .as_service_error()
                        .map(|service| service.is_not_found_exception())
                        .unwrap_or(false) =>
                {
                    Ok(())
                }
                Err(error) => Err(api(
                    format!("delete {} in {}", instance.name, instance.region),
                    DisplayErrorContext(&error),
                )),
            }
        })
    }

    fn delete_tagged(&self, tag: &str) -> Result<(), ProviderError> {
        for region in self.clients.keys() {
            for instance in self.list_instances(region, tag)? {
                self.delete_instance(&instance)?;
            }
        }
        Ok(())
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceHandle, ProviderError> {
        let client = self.client(&request.region)?;
        self.block_on(async {
            client
                .create_instances_from_snapshot()
                .instance_names(&request.name)
                .availability_zone(format!("{}a", request.region))
                .instance_snapshot_name(&request.image_id)
                .bundle_id(&self.bundle_id)
                .user_data(&request.user_data)
                .tags(Tag::builder().key(&request.tag).build())
                .send()
                .await
                .map_err(|error| api(format!("create {}", request.name), DisplayErrorContext(&error)))
        })?;
        Ok(InstanceHandle {
            provider: ProviderKind::Lightsail,
            region: request.region.clone(),
            name: request.name.clone(),
            id: request.name.clone(),
        })
    }

    /// Lightsail launches from a snapshot name; resolving confirms the
    /// snapshot exists in the region and returns its name.
    fn resolve_snapshot(&self, region: &str, name: &str) -> Result<String, ProviderError> {
        let client = self.client(region)?;
        self.block_on(async {
            let output = client
                .get_instance_snapshot()
                .instance_snapshot_name(name)
                .send()
                .await
                .map_err(|error| {
                    let missing = error
                        .as_service_error()
                        .map(|service| service.is_not_found_exception())
                        .unwrap_or(false);
                    if missing {
                        snapshot_not_found(region, name)
                    } else {
                        transport(format!("get snapshot {name}"), DisplayErrorContext(&error))
                    }
                })?;
            output
                .instance_snapshot()
                .and_then(|snapshot| snapshot.name())
                .map(str::to_string)
                .ok_or_else(|| snapshot_not_found(region, name))
        })
    }
}

fn snapshot_not_found(region: &str, name: &str) -> ProviderError {
    ProviderError::SnapshotNotFound {
        provider: ProviderKind::Lightsail,
        name: name.to_string(),
        region: Some(region.to_string()),
    }
}

fn transport(action: impl std::fmt::Display, error: impl std::fmt::Display) -> ProviderError {
    ProviderError::Transport {
        provider: ProviderKind::Lightsail,
        message: format!("{action}: {error}"),
    }
}

fn api(action: impl std::fmt::Display, error: impl std::fmt::Display) -> ProviderError {
    ProviderError::Api {
        provider: ProviderKind::Lightsail,
        message: format!("{action}: {error}"),
    }
}
