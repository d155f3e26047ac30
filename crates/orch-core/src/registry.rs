//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Concurrent in-memory store of provisioned resources."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{OrchestrationError, RecordKind, Result};
use crate::models::{Resource, ResourceQuery};

/// Resources keyed by id, enumerated in insertion order.
///
/// Each call holds the lock for its full duration, so readers never observe a
/// partially written resource.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: RwLock<IndexMap<String, Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new resource. Ids are never reused, so an occupied id is rejected
    /// and the stored resource is left untouched.
    pub fn insert(&self, resource: Resource) -> Result<()> {
        match self.resources.write().entry(resource.id.clone()) {
            Entry::Occupied(occupied) => Err(OrchestrationError::already_exists(
                RecordKind::Resource,
                occupied.key().as_str(),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(resource);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Resource> {
        self.resources.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.read().contains_key(id)
    }

    /// Overwrite the lifecycle status of an existing resource.
    pub fn set_status(&self, id: &str, status: &str, now: DateTime<Utc>) -> Result<Resource> {
        let mut guard = self.resources.write();
        let resource = guard
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::not_found(RecordKind::Resource, id))?;
        resource.status = status.to_owned();
        resource.last_updated_at = Some(now);
        Ok(resource.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Resource> {
        self.resources.write().shift_remove(id)
    }

    /// Apply filters then return the requested page of matches.
    pub fn query(&self, query: &ResourceQuery) -> Result<Vec<Resource>> {
        query.validate()?;
        let guard = self.resources.read();
        Ok(guard
            .values()
            .filter(|resource| query.matches(resource))
            .skip(query.skip())
            .take(query.page_size as usize)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }
}
