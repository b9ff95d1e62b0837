//! Deployment status store

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::errors::BackendError;
use crate::models::deployment::{DeploymentStatus, TargetType};
use crate::utils::generate_uuid;

/// In-memory registry of deployment status records
///
/// Each record is written only by the workflow that created it, so a single
/// map-level lock is enough.
#[derive(Default)]
pub struct DeploymentStatusStore {
    entries: RwLock<HashMap<String, DeploymentStatus>>,
}

impl DeploymentStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending record and return its id
    pub fn create(&self, target: TargetType) -> String {
        let id = generate_uuid();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(id.clone(), DeploymentStatus::new(id.clone(), target));
        id
    }

    /// Mutate a record in place
    pub fn update<F, R>(&self, id: &str, mutator: F) -> Result<R, BackendError>
    where
        F: FnOnce(&mut DeploymentStatus) -> R,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let status = entries
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("deployment {}", id)))?;
        Ok(mutator(status))
    }

    pub fn get(&self, id: &str) -> Option<DeploymentStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned()
    }

    pub fn list(&self) -> BTreeMap<String, DeploymentStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    /// Remove a record. An in-flight workflow keeps running.
    pub fn delete(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(id).is_some()
    }

    /// Drop terminal records created more than `age` ago
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        self.remove_older_than(age).len()
    }

    /// Same as [`Self::cleanup_older_than`], returning the removed ids
    pub fn remove_older_than(&self, age: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(age)
            .map(|age| Utc::now() - age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, status)| status.is_terminal() && status.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
