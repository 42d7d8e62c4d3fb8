use dashmap::DashMap;
use hostagent_common::{Instance, InstanceId};

/// In-memory table of instances keyed by id, with a secondary index by
/// runtime reference for reconciliation lookups.
///
/// Each call is consistent for a single record. Callers that need more (read
/// then write) hold the instance lock from [`crate::locks::InstanceLocks`].
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, Instance>,
    by_runtime_ref: DashMap<String, InstanceId>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// All instances, oldest first.
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.list().into_iter().map(|instance| instance.id).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn upsert(&self, instance: Instance) {
        let previous_ref = self
            .instances
            .get(&instance.id)
            .and_then(|entry| entry.runtime_ref.clone());
        if let Some(previous_ref) = previous_ref {
            if instance.runtime_ref.as_deref() != Some(previous_ref.as_str()) {
                self.by_runtime_ref.remove(&previous_ref);
            }
        }
        if let Some(runtime_ref) = &instance.runtime_ref {
            self.by_runtime_ref
                .insert(runtime_ref.clone(), instance.id.clone());
        }
        self.instances.insert(instance.id.clone(), instance);
    }

    /// Mutate an instance in place and return the updated copy.
    pub fn update<F>(&self, id: &str, mutate: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let (updated, previous_ref) = {
            let mut entry = self.instances.get_mut(id)?;
            let previous_ref = entry.runtime_ref.clone();
            mutate(entry.value_mut());
            entry.touch();
            (entry.value().clone(), previous_ref)
        };
        if updated.runtime_ref != previous_ref {
            if let Some(previous_ref) = previous_ref {
                self.by_runtime_ref.remove(&previous_ref);
            }
            if let Some(runtime_ref) = &updated.runtime_ref {
                self.by_runtime_ref
                    .insert(runtime_ref.clone(), updated.id.clone());
            }
        }
        Some(updated)
    }

    pub fn remove(&self, id: &str) -> Option<Instance> {
        let (_, instance) = self.instances.remove(id)?;
        if let Some(runtime_ref) = &instance.runtime_ref {
            self.by_runtime_ref.remove(runtime_ref);
        }
        Some(instance)
    }

    pub fn find_by_runtime_ref(&self, runtime_ref: &str) -> Option<Instance> {
        let id = self.by_runtime_ref.get(runtime_ref)?.value().clone();
        self.get(&id)
    }
}
