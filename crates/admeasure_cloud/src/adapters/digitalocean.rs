//! DigitalOcean [`ComputeProvider`] over the v2 REST API.

use std::time::Duration;

use admeasure_core::ProviderKind;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::compute::{ComputeProvider, CreateInstanceRequest, InstanceHandle, ProviderError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
struct DropletList {
    #[serde(default)]
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    region: RegionRef,
}

#[derive(Debug, Deserialize)]
struct RegionRef {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotList {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    id: Value,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Pages,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    next: Option<String>,
}

#[derive(Clone)]
pub struct DigitalOceanProvider {
    client: Client,
    endpoint: String,
    token: String,
    size: String,
    ssh_keys: Vec<String>,
}

impl std::fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl DigitalOceanProvider {
    pub fn new(
        endpoint: &str,
        token: impl Into<String>,
        size: impl Into<String>,
        ssh_keys: Vec<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| transport("build HTTP client", error))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
            size: size.into(),
            ssh_keys,
        })
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .map_err(|error| transport(format!("GET {url}"), error))?;
        let response = ensure_success(response, &format!("GET {url}"))?;
        response
            .json()
            .map_err(|error| transport(format!("decode GET {url}"), error))
    }

    fn delete(&self, url: &str) -> Result<StatusCode, ProviderError> {
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .map_err(|error| transport(format!("DELETE {url}"), error))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StatusCode::NOT_FOUND);
        }
        ensure_success(response, &format!("DELETE {url}")).map(|response| response.status())
    }
}

impl ComputeProvider for DigitalOceanProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    fn list_instances(&self, region: &str, tag: &str) -> Result<Vec<InstanceHandle>, ProviderError> {
        let mut instances = Vec::new();
        let mut next = Some(format!(
            "{}/v2/droplets?tag_name={tag}&per_page={PAGE_SIZE}",
            self.endpoint
        ));
        while let Some(url) = next.take() {
            let page: DropletList = self.get_json(&url)?;
            instances.extend(
                page.droplets
                    .into_iter()
                    .filter(|droplet| droplet.region.slug == region)
                    .map(|droplet| InstanceHandle {
                        provider: ProviderKind::DigitalOcean,
                        region: droplet.region.slug,
                        name: droplet.name,
                        id: droplet.id.to_string(),
                    }),
            );
            next = page.links.pages.next;
        }
        Ok(instances)
    }

    fn delete_instance(&self, instance: &InstanceHandle) -> Result<(), ProviderError> {
        self.delete(&format!("{}/v2/droplets/{}", self.endpoint, instance.id))
            .map(|_| ())
    }

    fn delete_tagged(&self, tag: &str) -> Result<(), ProviderError> {
        self.delete(&format!("{}/v2/droplets?tag_name={tag}", self.endpoint))
            .map(|_| ())
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceHandle, ProviderError> {
        // Numeric image ids must be sent as numbers; strings are read as slugs.
        let image = request
            .image_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(request.image_id.clone()));
        let body = json!({
            "name": request.name,
            "region": request.region,
            "size": self.size,
            "image": image,
            "ssh_keys": self.ssh_keys,
            "user_data": request.user_data,
            "tags": [request.tag],
        });
        let url = format!("{}/v2/droplets", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .map_err(|error| transport(format!("POST {url}"), error))?;
        let created: DropletEnvelope = ensure_success(response, &format!("create {}", request.name))?
            .json()
            .map_err(|error| transport("decode created droplet", error))?;
        Ok(InstanceHandle {
            provider: ProviderKind::DigitalOcean,
            region: created.droplet.region.slug,
            name: created.droplet.name,
            id: created.droplet.id.to_string(),
        })
    }

    fn resolve_snapshot(&self, _region: &str, name: &str) -> Result<String, ProviderError> {
        let mut next = Some(format!(
            "{}/v2/snapshots?resource_type=droplet&per_page={PAGE_SIZE}",
            self.endpoint
        ));
        while let Some(url) = next.take() {
            let page: SnapshotList = self.get_json(&url)?;
            if let Some(snapshot) = page.snapshots.into_iter().find(|snapshot| snapshot.name == name) {
                return Ok(match snapshot.id {
                    Value::String(id) => id,
                    other => other.to_string(),
                });
            }
            next = page.links.pages.next;
        }
        Err(ProviderError::SnapshotNotFound {
            provider: ProviderKind::DigitalOcean,
            name: name.to_string(),
            region: None,
        })
    }
}

fn ensure_success(response: Response, action: &str) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ProviderError::Api {
        provider: ProviderKind::DigitalOcean,
        message: format!("{action} returned {status}: {}", body.trim()),
    })
}

fn transport(action: impl std::fmt::Display, error: impl std::fmt::Display) -> ProviderError {
    ProviderError::Transport {
        provider: ProviderKind::DigitalOcean,
        message: format!("{action}: {error}"),
    }
}
