//! Kubernetes BlockDevice Store
//!
//! Persists BlockDevice resources through the Kubernetes API. Status is
//! written through the status subresource. Writes after the initial create
//! only touch the attachment state and are guarded by the resource version,
//! so a claim set by a consumer in the meantime is never overwritten.

use crate::crd::{BlockDeviceResource, DeviceState, HOSTNAME_LABEL};
use crate::domain::ports::{BlockDeviceList, BlockDeviceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

const KIND: &str = "BlockDevice";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kubernetes store
#[derive(Debug, Clone)]
pub struct KubeStoreConfig {
    /// Namespace holding BlockDevice resources
    pub namespace: String,
    /// Hostname used to scope list calls to this node
    pub hostname: String,
}

impl Default for KubeStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            hostname: String::new(),
        }
    }
}

// =============================================================================
// Kube Store
// =============================================================================

/// BlockDevice store backed by the Kubernetes API server
pub struct KubeBlockDeviceStore {
    config: KubeStoreConfig,
    api: Api<BlockDeviceResource>,
}

impl KubeBlockDeviceStore {
    /// Create a store for the configured namespace
    pub fn new(client: Client, config: KubeStoreConfig) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self { config, api }
    }

    /// Patch the status subresource, guarded by the resource version
    async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: serde_json::Value,
    ) -> Result<()> {
        let patch = status_patch(resource_version, status);
        match self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(write_error(name, e)),
        }
    }

    fn label_selector(&self) -> Option<String> {
        if self.config.hostname.is_empty() {
            None
        } else {
            Some(format!("{}={}", HOSTNAME_LABEL, self.config.hostname))
        }
    }
}

#[async_trait]
impl BlockDeviceStore for KubeBlockDeviceStore {
    async fn get(&self, name: &str) -> Result<BlockDeviceResource> {
        match self.api.get(name).await {
            Ok(resource) => Ok(resource),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(Error::ResourceNotFound {
                    kind: KIND.into(),
                    name: name.into(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, resource: BlockDeviceResource) -> Result<()> {
        let name = resource.name().to_string();
        let created = match self.api.create(&PostParams::default(), &resource).await {
            Ok(created) => created,
            Err(kube::Error::Api(response)) if response.code == 409 => {
                return Err(Error::ResourceExists {
                    kind: KIND.into(),
                    name,
                });
            }
            Err(e) => return Err(e.into()),
        };
        // the initial status is the only write that sets the claim state
        let status = serde_json::to_value(resource.status.clone().unwrap_or_default())?;
        self.patch_status(&name, created.metadata.resource_version.as_deref(), status)
            .await?;
        info!(name = %name, path = %resource.spec.path, "created BlockDevice resource");
        Ok(())
    }

    async fn update(
        &self,
        resource: BlockDeviceResource,
        existing: &BlockDeviceResource,
    ) -> Result<()> {
        let merged = resource.merged_onto(existing);
        let replaced = self
            .api
            .replace(merged.name(), &PostParams::default(), &merged)
            .await
            .map_err(|e| write_error(merged.name(), e))?;
        debug!(
            name = %merged.name(),
            resource_version = ?replaced.metadata.resource_version,
            "replaced BlockDevice resource"
        );
        self.patch_status(
            merged.name(),
            replaced.metadata.resource_version.as_deref(),
            state_status(DeviceState::Active),
        )
        .await?;
        info!(name = %merged.name(), path = %merged.spec.path, "updated BlockDevice resource");
        Ok(())
    }

    async fn deactivate(&self, resource: &BlockDeviceResource) -> Result<()> {
        self.patch_status(
            resource.name(),
            resource.metadata.resource_version.as_deref(),
            state_status(DeviceState::Inactive),
        )
        .await?;
        info!(name = %resource.name(), "deactivated BlockDevice resource");
        Ok(())
    }

    async fn list(&self) -> Result<BlockDeviceList> {
        let mut params = ListParams::default();
        if let Some(selector) = self.label_selector() {
            params = params.labels(&selector);
        }
        let list = self.api.list(&params).await?;
        debug!(count = list.items.len(), "listed BlockDevice resources");
        Ok(BlockDeviceList::new(list.items))
    }

    fn store_name(&self) -> &str {
        "kubernetes"
    }
}

/// Status carrying only the attachment state, the claim belongs to consumers
fn state_status(state: DeviceState) -> serde_json::Value {
    json!({ "state": state })
}

/// Merge patch of a status, with the resource version as precondition
fn status_patch(resource_version: Option<&str>, status: serde_json::Value) -> serde_json::Value {
    match resource_version {
        Some(version) => json!({
            "metadata": { "resourceVersion": version },
            "status": status,
        }),
        None => json!({ "status": status }),
    }
}

fn write_error(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind: KIND.into(),
            name: name.into(),
        },
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind: KIND.into(),
            name: name.into(),
        },
        e => e.into(),
    }
}
