//! Definition store: publish, resolve, and archive workflow definitions.
//!
//! Publishing runs the full graph validation and assigns the next version
//! number atomically; published versions are immutable. Definition documents
//! are YAML (JSON parses too, YAML being a superset), with file helpers for
//! the CLI.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{DefinitionDraft, DefinitionStatus, WorkflowDefinition};
use thiserror::Error;
use uuid::Uuid;

use super::graph::{self, Violation};
use crate::repository::WorkflowRepository;

/// Errors from the definition store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The draft violates publish-time rules; the complete list is attached.
    #[error("definition is invalid: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    #[error("workflow definition not found")]
    NotFound,

    #[error("failed to parse definition document: {0}")]
    Parse(String),

    #[error("failed to read definition file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.subject, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Versioned, immutable definition storage on top of a repository.
pub struct DefinitionStore<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> DefinitionStore<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Validate and publish a draft.
    ///
    /// A draft with an `id` publishes the next version of that workflow and
    /// archives the previously active version; without one a new workflow id
    /// is minted at version 1. Returns the stored definition.
    pub async fn publish(&self, draft: DefinitionDraft) -> Result<WorkflowDefinition, StoreError> {
        let violations = graph::validate_graph(
            &draft.name,
            &draft.steps,
            &draft.connections,
            &draft.triggers,
            &draft.variables,
        );
        if !violations.is_empty() {
            return Err(StoreError::Validation(violations));
        }

        let (id, version, superseded) = match draft.id {
            Some(id) => match self.repo.get_latest_definition(&id).await? {
                Some(latest) => {
                    let superseded = (latest.status == DefinitionStatus::Active)
                        .then_some(latest.version);
                    (id, latest.version + 1, superseded)
                }
                None => (id, 1, None),
            },
            None => (Uuid::now_v7(), 1, None),
        };

        let def = WorkflowDefinition {
            id,
            name: draft.name,
            description: draft.description,
            version,
            status: DefinitionStatus::Active,
            steps: draft.steps,
            connections: draft.connections,
            triggers: draft.triggers,
            variables: draft.variables,
            permissions: draft.permissions,
            created_at: Utc::now(),
        };
        self.repo.insert_definition(&def).await?;

        // The previous active version stops accepting new instances; running
        // instances keep their pinned version.
        if let Some(old_version) = superseded {
            self.repo
                .set_definition_status(&id, old_version, DefinitionStatus::Archived)
                .await?;
        }

        tracing::info!(
            definition_id = %def.id,
            version = def.version,
            name = %def.name,
            "workflow definition published"
        );
        Ok(def)
    }

    /// Get a definition. `version = None` resolves the latest active version.
    pub async fn get(
        &self,
        id: &Uuid,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, StoreError> {
        match version {
            Some(v) => self
                .repo
                .get_definition(id, v)
                .await?
                .ok_or(StoreError::NotFound),
            None => self.latest_active(id).await,
        }
    }

    /// The latest active version of a workflow, if any.
    pub async fn latest_active(&self, id: &Uuid) -> Result<WorkflowDefinition, StoreError> {
        let versions = self.repo.list_definition_versions(id).await?;
        versions
            .into_iter()
            .filter(|d| d.status == DefinitionStatus::Active)
            .max_by_key(|d| d.version)
            .ok_or(StoreError::NotFound)
    }

    /// Archive the latest active version. In-flight instances are unaffected;
    /// triggers for the definition are disabled from here on.
    pub async fn archive(&self, id: &Uuid) -> Result<WorkflowDefinition, StoreError> {
        let mut latest = self.latest_active(id).await?;
        self.repo
            .set_definition_status(id, latest.version, DefinitionStatus::Archived)
            .await?;
        latest.status = DefinitionStatus::Archived;
        tracing::info!(definition_id = %id, version = latest.version, "workflow definition archived");
        Ok(latest)
    }

    /// Latest version of every stored definition.
    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self.repo.list_definitions().await?)
    }

    /// All versions of one definition, oldest first.
    pub async fn versions(&self, id: &Uuid) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let versions = self.repo.list_definition_versions(id).await?;
        if versions.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(versions)
    }
}

// ---------------------------------------------------------------------------
// Document helpers
// ---------------------------------------------------------------------------

/// Parse a draft definition from a YAML (or JSON) document.
pub fn parse_draft(content: &str) -> Result<DefinitionDraft, StoreError> {
    serde_yaml_ng::from_str(content).map_err(|e| StoreError::Parse(e.to_string()))
}

/// Load a draft definition from a file.
pub fn load_draft(path: &Path) -> Result<DefinitionDraft, StoreError> {
    let content = std::fs::read_to_string(path)?;
    parse_draft(&content)
}

/// Offline validation for the CLI: parse errors aside, returns the full
/// violation list without touching storage.
pub fn validate_draft(draft: &DefinitionDraft) -> Vec<Violation> {
    graph::validate_graph(
        &draft.name,
        &draft.steps,
        &draft.connections,
        &draft.triggers,
        &draft.variables,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowRepository;
    use stepline_types::workflow::{Connection, Permissions, StepConfig, StepDefinition};

    fn draft(name: &str) -> DefinitionDraft {
        DefinitionDraft {
            id: None,
            name: name.to_string(),
            description: None,
            steps: vec![
                StepDefinition {
                    id: "start".to_string(),
                    name: "Start".to_string(),
                    config: StepConfig::Task {
                        assignee_role: "operator".to_string(),
                        estimated_duration_secs: None,
                    },
                },
                StepDefinition {
                    id: "finish".to_string(),
                    name: "Finish".to_string(),
                    config: StepConfig::Notification {
                        template_id: "done".to_string(),
                    },
                },
            ],
            connections: vec![Connection {
                from: "start".to_string(),
                to: "finish".to_string(),
                guard: None,
                label: None,
            }],
            triggers: vec![],
            variables: vec![],
            permissions: Permissions::default(),
        }
    }

    fn store() -> DefinitionStore<InMemoryWorkflowRepository> {
        DefinitionStore::new(Arc::new(InMemoryWorkflowRepository::new()))
    }

    #[tokio::test]
    async fn test_publish_assigns_version_one() {
        let store = store();
        let def = store.publish(draft("onboarding")).await.unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.status, DefinitionStatus::Active);

        let fetched = store.get(&def.id, None).await.unwrap();
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_republish_increments_version_and_archives_previous() {
        let store = store();
        let v1 = store.publish(draft("onboarding")).await.unwrap();

        let mut next = draft("onboarding");
        next.id = Some(v1.id);
        let v2 = store.publish(next).await.unwrap();
        assert_eq!(v2.version, 2);

        // Latest active resolves to v2; v1 is archived but still fetchable.
        let active = store.get(&v1.id, None).await.unwrap();
        assert_eq!(active.version, 2);
        let pinned = store.get(&v1.id, Some(1)).await.unwrap();
        assert_eq!(pinned.status, DefinitionStatus::Archived);
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_graph_with_all_violations() {
        let store = store();
        let mut bad = draft("broken");
        bad.connections.push(Connection {
            from: "start".to_string(),
            to: "ghost".to_string(),
            guard: None,
            label: None,
        });
        bad.steps[0].config = StepConfig::Task {
            assignee_role: String::new(),
            estimated_duration_secs: None,
        };

        let err = store.publish(bad).await.unwrap_err();
        match err {
            StoreError::Validation(violations) => {
                assert!(violations.len() >= 2, "got {violations:?}");
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_archive_disables_resolution() {
        let store = store();
        let def = store.publish(draft("retire-me")).await.unwrap();
        let archived = store.archive(&def.id).await.unwrap();
        assert_eq!(archived.status, DefinitionStatus::Archived);

        let err = store.get(&def.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        // Explicit version access still works.
        assert!(store.get(&def.id, Some(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_archive_without_active_version_errors() {
        let store = store();
        let err = store.archive(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_parse_draft_yaml_and_json() {
        let yaml = r#"
name: leave-request
steps:
  - id: submit
    name: Submit
    config:
      type: task
      assignee_role: employee
connections: []
"#;
        let parsed = parse_draft(yaml).unwrap();
        assert_eq!(parsed.name, "leave-request");

        let json = r#"{"name":"leave-request","steps":[],"connections":[]}"#;
        assert!(parse_draft(json).is_ok());

        assert!(parse_draft("{{nonsense").is_err());
    }

    #[test]
    fn test_validate_draft_offline() {
        let ok = draft("fine");
        assert!(validate_draft(&ok).is_empty());

        let mut bad = draft("fine");
        bad.steps.truncate(1);
        // start -> finish now dangles.
        assert!(!validate_draft(&bad).is_empty());
    }
}
