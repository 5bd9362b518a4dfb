//! In-memory workflow repository.
//!
//! Backs unit tests and embedded single-process deployments. Mirrors the
//! SQLite implementation's semantics: immutable definition versions,
//! append-only logs, conflict on duplicate keys.

use std::collections::HashMap;
use std::sync::Arc;

use stepline_types::error::RepositoryError;
use stepline_types::workflow::{
    DefinitionStatus, ExecutionLogEntry, InstanceStatus, WorkflowDefinition, WorkflowInstance,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Store {
    /// Keyed by (definition id, version).
    definitions: HashMap<(Uuid, u32), WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    /// Per-instance log, kept sorted by seq (appends arrive in order).
    logs: HashMap<Uuid, Vec<ExecutionLogEntry>>,
}

/// Thread-safe in-memory implementation of [`WorkflowRepository`].
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        let key = (def.id, def.version);
        if store.definitions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "definition {} version {} already exists",
                def.id, def.version
            )));
        }
        store.definitions.insert(key, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.definitions.get(&(*id, version)).cloned())
    }

    async fn get_latest_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .definitions
            .values()
            .filter(|d| d.id == *id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let store = self.store.read().await;
        let mut versions: Vec<WorkflowDefinition> = store
            .definitions
            .values()
            .filter(|d| d.id == *id)
            .cloned()
            .collect();
        versions.sort_by_key(|d| d.version);
        Ok(versions)
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let store = self.store.read().await;
        let mut latest: HashMap<Uuid, WorkflowDefinition> = HashMap::new();
        for def in store.definitions.values() {
            match latest.get(&def.id) {
                Some(existing) if existing.version >= def.version => {}
                _ => {
                    latest.insert(def.id, def.clone());
                }
            }
        }
        let mut defs: Vec<WorkflowDefinition> = latest.into_values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn set_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: DefinitionStatus,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        match store.definitions.get_mut(&(*id, version)) {
            Some(def) => {
                def.status = status;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        if store.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        store.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        match store.instances.get_mut(&instance.id) {
            Some(slot) => {
                *slot = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        definition_id: &Uuid,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let store = self.store.read().await;
        let mut instances: Vec<WorkflowInstance> = store
            .instances
            .values()
            .filter(|i| i.definition_id == *definition_id)
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        instances.truncate(limit as usize);
        Ok(instances)
    }

    async fn append_log(&self, entries: &[ExecutionLogEntry]) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        for entry in entries {
            let log = store.logs.entry(entry.instance_id).or_default();
            if log.last().is_some_and(|last| entry.seq <= last.seq) {
                return Err(RepositoryError::Conflict(format!(
                    "log seq {} for instance {} is not monotonic",
                    entry.seq, entry.instance_id
                )));
            }
            log.push(entry.clone());
        }
        Ok(())
    }

    async fn list_log(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.logs.get(instance_id).cloned().unwrap_or_default())
    }

    async fn next_log_seq(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .logs
            .get(instance_id)
            .and_then(|log| log.last())
            .map(|last| last.seq + 1)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepline_types::workflow::{ExecutionState, LogLevel, Permissions};

    fn minimal_definition(id: Uuid, version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            id,
            name: "test-flow".to_string(),
            description: None,
            version,
            status: DefinitionStatus::Active,
            steps: vec![],
            connections: vec![],
            triggers: vec![],
            variables: vec![],
            permissions: Permissions::default(),
            created_at: Utc::now(),
        }
    }

    fn minimal_instance(definition_id: Uuid) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id,
            definition_version: 1,
            status: InstanceStatus::Running,
            state: ExecutionState::default(),
            initiated_by: "test".to_string(),
            created_at: Utc::now(),
            started_at: Utc::now(),
            completed_at: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_definition_versions_are_immutable() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        repo.insert_definition(&minimal_definition(id, 1)).await.unwrap();

        let dup = repo.insert_definition(&minimal_definition(id, 1)).await;
        assert!(matches!(dup, Err(RepositoryError::Conflict(_))));

        repo.insert_definition(&minimal_definition(id, 2)).await.unwrap();
        let latest = repo.get_latest_definition(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let versions = repo.list_definition_versions(&id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 1);
    }

    #[tokio::test]
    async fn test_list_definitions_returns_latest_only() {
        let repo = InMemoryWorkflowRepository::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        repo.insert_definition(&minimal_definition(a, 1)).await.unwrap();
        repo.insert_definition(&minimal_definition(a, 2)).await.unwrap();
        repo.insert_definition(&minimal_definition(b, 1)).await.unwrap();

        let defs = repo.list_definitions().await.unwrap();
        assert_eq!(defs.len(), 2);
        let a_entry = defs.iter().find(|d| d.id == a).unwrap();
        assert_eq!(a_entry.version, 2);
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let repo = InMemoryWorkflowRepository::new();
        let def_id = Uuid::now_v7();
        let mut instance = minimal_instance(def_id);
        repo.create_instance(&instance).await.unwrap();

        instance.status = InstanceStatus::Completed;
        instance.completed_at = Some(Utc::now());
        repo.update_instance(&instance).await.unwrap();

        let fetched = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InstanceStatus::Completed);

        let running = repo
            .list_instances(&def_id, Some(InstanceStatus::Running), 10)
            .await
            .unwrap();
        assert!(running.is_empty());
        let completed = repo
            .list_instances(&def_id, Some(InstanceStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_log_is_append_only_and_ordered() {
        let repo = InMemoryWorkflowRepository::new();
        let instance_id = Uuid::now_v7();
        assert_eq!(repo.next_log_seq(&instance_id).await.unwrap(), 0);

        let entry = |seq: u64, msg: &str| ExecutionLogEntry {
            instance_id,
            seq,
            level: LogLevel::Info,
            message: msg.to_string(),
            step_id: None,
            logged_at: Utc::now(),
        };

        repo.append_log(&[entry(0, "created"), entry(1, "step started")])
            .await
            .unwrap();
        assert_eq!(repo.next_log_seq(&instance_id).await.unwrap(), 2);

        // Re-using a seq is rejected.
        let stale = repo.append_log(&[entry(1, "dup")]).await;
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));

        let log = repo.list_log(&instance_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "created");
        assert_eq!(log[1].seq, 1);
    }
}
