//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, instances, and
//! the append-only execution log. The infrastructure layer (stepline-infra)
//! implements this trait with SQLite persistence; `memory` provides an
//! in-process implementation for tests and embedded use.

use stepline_types::error::RepositoryError;
use stepline_types::workflow::{
    ExecutionLogEntry, InstanceStatus, WorkflowDefinition, WorkflowInstance,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** versioned, immutable-after-publish workflow documents,
///   keyed by `(id, version)`.
/// - **Instances:** workflow executions with their mutable state blob.
/// - **Log:** the append-only per-instance execution log, ordered by `seq`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition version. Fails with `Conflict` if the
    /// `(id, version)` pair already exists; published versions are never
    /// overwritten.
    fn insert_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a specific definition version.
    fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the highest-numbered version of a definition, regardless of status.
    fn get_latest_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List every version of a definition, ordered by version ascending.
    fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// List the latest version of every stored definition.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Update the lifecycle status of a stored definition version.
    fn set_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: stepline_types::workflow::DefinitionStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a new instance record.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist an instance's current status, state blob, and terminal fields.
    fn update_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an instance by its UUID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances of a definition (all versions), newest first.
    fn list_instances(
        &self,
        definition_id: &Uuid,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Execution log
    // -----------------------------------------------------------------------

    /// Append entries to an instance's execution log.
    ///
    /// `seq` values are assigned by the caller (the engine holds the
    /// per-instance lock, so they are gap-free and monotonic). Entries are
    /// never updated or deleted.
    fn append_log(
        &self,
        entries: &[ExecutionLogEntry],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Read an instance's log ordered by `seq` ascending.
    fn list_log(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionLogEntry>, RepositoryError>> + Send;

    /// The next unused `seq` for an instance (0 when the log is empty).
    fn next_log_seq(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
