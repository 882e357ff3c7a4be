//! In-Memory BlockDevice Store
//!
//! Store used in standalone mode (no Kubernetes). Every mutation is recorded
//! in a journal so callers can inspect what the engine did.

use crate::crd::BlockDeviceResource;
use crate::domain::ports::{BlockDeviceList, BlockDeviceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

const KIND: &str = "BlockDevice";

/// Mutation applied to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create(String),
    Update(String),
    Deactivate(String),
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<String, BlockDeviceResource>,
    journal: Vec<StoreOp>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// BlockDevice store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryBlockDeviceStore {
    state: Mutex<State>,
}

impl InMemoryBlockDeviceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with resources, without journaling them
    pub fn with_resources(resources: impl IntoIterator<Item = BlockDeviceResource>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for mut resource in resources {
                resource.metadata.resource_version = Some(state.next_revision());
                state.resources.insert(resource.name().to_string(), resource);
            }
        }
        store
    }

    /// Mutations applied so far
    pub fn journal(&self) -> Vec<StoreOp> {
        self.state.lock().journal.clone()
    }

    /// Set the claim state of a stored resource, as a consumer would
    #[cfg(test)]
    pub(crate) fn set_claim_state(&self, name: &str, claim_state: crate::crd::ClaimState) {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        if let Some(resource) = state.resources.get_mut(name) {
            if let Some(status) = resource.status.as_mut() {
                status.claim_state = claim_state;
            }
            resource.metadata.resource_version = Some(revision);
        }
    }

    /// Get a stored resource without going through the port
    pub fn resource(&self, name: &str) -> Option<BlockDeviceResource> {
        self.state.lock().resources.get(name).cloned()
    }

    /// All stored resources ordered by name
    pub fn resources(&self) -> Vec<BlockDeviceResource> {
        self.state.lock().resources.values().cloned().collect()
    }
}

#[async_trait]
impl BlockDeviceStore for InMemoryBlockDeviceStore {
    async fn get(&self, name: &str) -> Result<BlockDeviceResource> {
        self.resource(name).ok_or_else(|| Error::ResourceNotFound {
            kind: KIND.into(),
            name: name.into(),
        })
    }

    async fn create(&self, mut resource: BlockDeviceResource) -> Result<()> {
        let mut state = self.state.lock();
        let name = resource.name().to_string();
        if state.resources.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: KIND.into(),
                name,
            });
        }
        resource.metadata.resource_version = Some(state.next_revision());
        debug!(name = %name, "created resource in memory");
        state.resources.insert(name.clone(), resource);
        state.journal.push(StoreOp::Create(name));
        Ok(())
    }

    async fn update(
        &self,
        resource: BlockDeviceResource,
        existing: &BlockDeviceResource,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let name = existing.name().to_string();
        let stored = state.resources.get(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: KIND.into(),
            name: name.clone(),
        })?;
        check_version(stored, existing)?;
        let mut merged = resource.merged_onto(existing);
        merged.metadata.resource_version = Some(state.next_revision());
        state.resources.insert(name.clone(), merged);
        state.journal.push(StoreOp::Update(name));
        Ok(())
    }

    async fn deactivate(&self, resource: &BlockDeviceResource) -> Result<()> {
        let mut state = self.state.lock();
        let name = resource.name().to_string();
        let revision = state.next_revision();
        let stored = state
            .resources
            .get_mut(&name)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: KIND.into(),
                name: name.clone(),
            })?;
        check_version(stored, resource)?;
        let mut inactive = stored.deactivated();
        inactive.metadata.resource_version = Some(revision);
        *stored = inactive;
        state.journal.push(StoreOp::Deactivate(name));
        Ok(())
    }

    async fn list(&self) -> Result<BlockDeviceList> {
        Ok(BlockDeviceList::new(self.resources()))
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}

/// Reject writes based on an outdated read, like the API server does
fn check_version(stored: &BlockDeviceResource, read: &BlockDeviceResource) -> Result<()> {
    match &read.metadata.resource_version {
        Some(version) if stored.metadata.resource_version.as_ref() != Some(version) => {
            Err(Error::Conflict {
                kind: KIND.into(),
                name: read.name().to_string(),
            })
        }
        _ => Ok(()),
    }
}
