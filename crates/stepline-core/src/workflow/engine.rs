//! Execution engine: drives workflow instances through their step graph.
//!
//! One logical driver per instance: a per-instance `tokio::sync::Mutex` held
//! in a `DashMap` serialises `advance`, `report_result` and `cancel`, so
//! concurrent callers queue briefly and observe post-transition state.
//! Instances of different workflows (and of the same workflow) are fully
//! concurrent with each other.
//!
//! # Advance semantics
//!
//! `advance` walks the active cursors. A step sees `start` on first
//! activation and `poll` on every later visit; `Completed` results are
//! recorded, logged, and routed along the selected connection, recursing
//! synchronously through immediately-completing steps (decision,
//! notification, parallel fan-out) until every cursor rests on a pending
//! step or the instance reaches a terminal status. Log entries are appended
//! before the state update they describe, so the audit trail never lags the
//! state on failure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{
    DefinitionStatus, ExecutionLogEntry, ExecutionState, InstanceStatus, LogLevel, StepConfig,
    StepKind, WorkflowDefinition, WorkflowInstance,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::graph;
use super::step::{ExecutorOutcome, IntentSink, StepRunner, select_connection};
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active workflow definition found")]
    DefinitionNotFound,

    #[error("workflow instance not found")]
    InstanceNotFound,

    #[error("missing required variable '{0}'")]
    MissingRequiredVariable(String),

    #[error("variable '{name}' has the wrong type, expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("instance {0} is not running")]
    InstanceNotRunning(Uuid),

    #[error("step '{0}' is not an active pending step")]
    StepNotActive(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives workflow instances. Generic over the repository and the outbound
/// intent sink.
pub struct ExecutionEngine<R: WorkflowRepository, S: IntentSink> {
    repo: Arc<R>,
    runner: StepRunner<S>,
    /// Per-instance advance locks keyed by instance id.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<R: WorkflowRepository, S: IntentSink> ExecutionEngine<R, S> {
    pub fn new(repo: Arc<R>, sink: S) -> Self {
        Self {
            repo,
            runner: StepRunner::new(sink),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    /// Create a new instance of the latest active version of a definition.
    ///
    /// Bindings are validated against the declared variables: missing
    /// required variables and type mismatches are rejected before anything
    /// is persisted; declared defaults fill the gaps. The cursor is placed
    /// on the entry step; the caller (or trigger dispatcher) advances.
    pub async fn create(
        &self,
        definition_id: Uuid,
        bindings: HashMap<String, Value>,
        actor: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.resolve_active(&definition_id).await?;
        let bindings = validate_bindings(&definition, bindings)?;

        let entry = graph::entry_step(&definition.steps, &definition.connections)
            .ok_or(EngineError::DefinitionNotFound)?;

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_version: definition.version,
            status: InstanceStatus::Running,
            state: ExecutionState {
                cursors: vec![entry.to_string()],
                bindings,
                ..ExecutionState::default()
            },
            initiated_by: actor.to_string(),
            created_at: now,
            started_at: now,
            completed_at: None,
            failure: None,
        };

        self.repo
            .append_log(&[ExecutionLogEntry {
                instance_id: instance.id,
                seq: 0,
                level: LogLevel::Info,
                message: format!("instance started by {actor}"),
                step_id: None,
                logged_at: now,
            }])
            .await?;
        self.repo.create_instance(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            actor = %actor,
            "workflow instance created"
        );
        Ok(instance)
    }

    async fn resolve_active(&self, id: &Uuid) -> Result<WorkflowDefinition, EngineError> {
        let versions = self.repo.list_definition_versions(id).await?;
        versions
            .into_iter()
            .filter(|d| d.status == DefinitionStatus::Active)
            .max_by_key(|d| d.version)
            .ok_or(EngineError::DefinitionNotFound)
    }

    // -----------------------------------------------------------------------
    // advance
    // -----------------------------------------------------------------------

    /// Drive an instance as far as it can go. Idempotent: advancing an
    /// instance whose cursors are all pending (or that is already terminal)
    /// changes nothing and appends no log entries.
    pub async fn advance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let instance = self
            .repo
            .get_instance(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound)?;
        if instance.status.is_terminal() {
            self.locks.remove(&instance_id);
            return Ok(instance);
        }
        self.run(instance, None, Vec::new()).await
    }

    // -----------------------------------------------------------------------
    // report_result
    // -----------------------------------------------------------------------

    /// Complete a pending task, approval, or wait step with an externally
    /// supplied payload, then advance.
    pub async fn report_result(
        &self,
        instance_id: Uuid,
        step_id: &str,
        actor: &str,
        payload: Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let instance = self
            .repo
            .get_instance(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound)?;
        if instance.status != InstanceStatus::Running {
            self.locks.remove(&instance_id);
            return Err(EngineError::InstanceNotRunning(instance_id));
        }

        let is_active_cursor = instance.state.cursors.iter().any(|c| c == step_id);
        let has_started = instance.state.step_entered_at.contains_key(step_id);
        if !is_active_cursor || !has_started {
            return Err(EngineError::StepNotActive(step_id.to_string()));
        }

        let definition = self.load_pinned(&instance).await?;
        let step = definition
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotActive(step_id.to_string()))?;
        if !matches!(step.kind(), StepKind::Task | StepKind::Approval | StepKind::Wait) {
            return Err(EngineError::StepNotActive(step_id.to_string()));
        }

        let pre_logs = vec![(
            LogLevel::Info,
            format!("result reported by {actor}"),
            Some(step_id.to_string()),
        )];
        self.run(instance, Some((step_id.to_string(), payload)), pre_logs)
            .await
    }

    // -----------------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------------

    /// Cooperatively cancel a running instance. Pending external work is
    /// simply orphaned; later `advance`/`report_result` calls are rejected.
    pub async fn cancel(
        &self,
        instance_id: Uuid,
        actor: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self
            .repo
            .get_instance(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound)?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::InstanceNotRunning(instance_id));
        }

        let seq = self.repo.next_log_seq(&instance_id).await?;
        self.repo
            .append_log(&[ExecutionLogEntry {
                instance_id,
                seq,
                level: LogLevel::Info,
                message: format!("instance cancelled by {actor}"),
                step_id: None,
                logged_at: Utc::now(),
            }])
            .await?;

        instance.status = InstanceStatus::Cancelled;
        instance.state.cursors.clear();
        instance.completed_at = Some(Utc::now());
        self.repo.update_instance(&instance).await?;
        self.locks.remove(&instance_id);

        tracing::info!(instance_id = %instance_id, actor = %actor, "workflow instance cancelled");
        Ok(instance)
    }

    /// Read an instance without advancing it.
    pub async fn get(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo
            .get_instance(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound)
    }

    /// Read an instance's execution log in sequence order.
    pub async fn logs(&self, instance_id: Uuid) -> Result<Vec<ExecutionLogEntry>, EngineError> {
        // Existence check so an unknown id is a 404, not an empty log.
        self.get(instance_id).await?;
        Ok(self.repo.list_log(&instance_id).await?)
    }

    async fn load_pinned(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowDefinition, EngineError> {
        self.repo
            .get_definition(&instance.definition_id, instance.definition_version)
            .await?
            .ok_or(EngineError::DefinitionNotFound)
    }

    // -----------------------------------------------------------------------
    // The drive loop
    // -----------------------------------------------------------------------

    /// Process every active cursor until all rest on pending steps or the
    /// instance is terminal. `injected` short-circuits one step's outcome to
    /// `Completed(payload)` (result reporting). Buffered log entries are
    /// flushed before the instance state is committed.
    async fn run(
        &self,
        mut instance: WorkflowInstance,
        mut injected: Option<(String, Value)>,
        pre_logs: Vec<(LogLevel, String, Option<String>)>,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.load_pinned(&instance).await?;
        let now = Utc::now();
        let mut logs: Vec<(LogLevel, String, Option<String>)> = pre_logs;

        // Queue of (step id, predecessor result carried into guard context).
        let mut queue: VecDeque<(String, Option<Value>)> = instance
            .state
            .cursors
            .drain(..)
            .map(|c| (c, None))
            .collect();
        let mut still_pending: Vec<String> = Vec::new();
        let mut failure: Option<String> = None;
        let mut failed_step: Option<String> = None;

        while let Some((step_id, carried)) = queue.pop_front() {
            let Some(step) = definition.step(&step_id) else {
                failure = Some(format!("cursor references unknown step '{step_id}'"));
                failed_step = Some(step_id);
                break;
            };

            let outcome = if injected.as_ref().is_some_and(|(id, _)| *id == step_id) {
                let (_, payload) = injected.take().unwrap_or_default();
                ExecutorOutcome::Completed(payload)
            } else if let Some(&entered_at) = instance.state.step_entered_at.get(&step_id) {
                self.runner.poll(step, entered_at, now)
            } else {
                instance.state.step_entered_at.insert(step_id.clone(), now);
                logs.push((
                    LogLevel::Info,
                    format!("step started ({})", step.kind().as_str()),
                    Some(step_id.clone()),
                ));
                self.runner
                    .start(
                        instance.id,
                        &definition,
                        step,
                        &instance.state.bindings,
                        carried.as_ref(),
                    )
                    .await
            };

            match outcome {
                ExecutorOutcome::Pending => still_pending.push(step_id),

                ExecutorOutcome::Failed(reason) => {
                    failure = Some(reason);
                    failed_step = Some(step_id);
                    break;
                }

                ExecutorOutcome::Completed(result) => {
                    if matches!(step.config, StepConfig::Approval { .. })
                        && result.get("auto") == Some(&Value::Bool(true))
                    {
                        logs.push((
                            LogLevel::Warning,
                            "approval timed out, auto-rejecting".to_string(),
                            Some(step_id.clone()),
                        ));
                    }
                    instance
                        .state
                        .step_results
                        .insert(step_id.clone(), result.clone());
                    logs.push((
                        LogLevel::Info,
                        "step completed".to_string(),
                        Some(step_id.clone()),
                    ));

                    // Parallel fans out on every outgoing connection
                    // unconditionally; guards play no role at a fork.
                    if matches!(step.config, StepConfig::Parallel { .. }) {
                        for conn in definition.outgoing(&step_id) {
                            self.activate(&mut instance.state, &conn.to);
                            queue.push_back((conn.to.clone(), Some(result.clone())));
                        }
                        continue;
                    }

                    if definition.outgoing(&step_id).is_empty() {
                        // Terminal step: this cursor ends here.
                        continue;
                    }

                    // Decisions route on the context their guards were
                    // chosen with; every other step routes on its own result.
                    let route_ctx = if matches!(step.config, StepConfig::Decision {}) {
                        carried.clone()
                    } else {
                        Some(result.clone())
                    };
                    match select_connection(
                        &definition,
                        &step_id,
                        &instance.state.bindings,
                        route_ctx.as_ref(),
                    ) {
                        Err(err) => {
                            failure = Some(format!(
                                "InvalidCondition: guard after step '{step_id}' failed: {err}"
                            ));
                            failed_step = Some(step_id);
                            break;
                        }
                        Ok(None) => {
                            failure = Some(format!(
                                "NoMatchingTransition: no connection matched after step '{step_id}'"
                            ));
                            failed_step = Some(step_id);
                            break;
                        }
                        Ok(Some(conn)) => {
                            let target = conn.to.clone();
                            if let Some(arity) = join_arity(&definition, &target) {
                                let arrivals = instance
                                    .state
                                    .join_arrivals
                                    .entry(target.clone())
                                    .or_insert(0);
                                *arrivals += 1;
                                logs.push((
                                    LogLevel::Info,
                                    format!("branch arrived at join ({}/{arity})", *arrivals),
                                    Some(target.clone()),
                                ));
                                if *arrivals >= arity {
                                    // All branches in: the join activates
                                    // exactly once.
                                    instance.state.join_arrivals.remove(&target);
                                    self.activate(&mut instance.state, &target);
                                    queue.push_back((target, None));
                                }
                                // Otherwise this branch's cursor ends here
                                // and the join waits for the rest.
                            } else {
                                self.activate(&mut instance.state, &target);
                                queue.push_back((target, Some(result.clone())));
                            }
                        }
                    }
                }
            }
        }

        if let Some(reason) = failure {
            // Full failure context in the audit trail: the failing step and a
            // snapshot of the bindings the instance was running with.
            let snapshot = serde_json::to_string(&instance.state.bindings)
                .unwrap_or_else(|_| "{}".to_string());
            tracing::warn!(
                instance_id = %instance.id,
                step_id = ?failed_step,
                reason = %reason,
                "workflow instance failed"
            );
            logs.push((
                LogLevel::Error,
                format!("instance failed: {reason}; bindings snapshot: {snapshot}"),
                failed_step,
            ));
            instance.status = InstanceStatus::Failed;
            instance.state.cursors.clear();
            instance.failure = Some(reason);
            instance.completed_at = Some(now);
        } else {
            instance.state.cursors = still_pending;
            if instance.state.cursors.is_empty() {
                logs.push((LogLevel::Info, "instance completed".to_string(), None));
                instance.status = InstanceStatus::Completed;
                instance.completed_at = Some(now);
                tracing::info!(instance_id = %instance.id, "workflow instance completed");
            }
        }

        // Log-before-state-commit: the audit entries land before the state
        // they describe.
        if !logs.is_empty() {
            let mut seq = self.repo.next_log_seq(&instance.id).await?;
            let entries: Vec<ExecutionLogEntry> = logs
                .into_iter()
                .map(|(level, message, step_id)| {
                    let entry = ExecutionLogEntry {
                        instance_id: instance.id,
                        seq,
                        level,
                        message,
                        step_id,
                        logged_at: now,
                    };
                    seq += 1;
                    entry
                })
                .collect();
            self.repo.append_log(&entries).await?;
        }
        self.repo.update_instance(&instance).await?;
        if instance.status.is_terminal() {
            // The instance can never advance again; drop its lock entry so
            // the map doesn't grow for the process lifetime. A racing caller
            // that already cloned the Arc just sees the terminal no-op path.
            self.locks.remove(&instance.id);
        }
        Ok(instance)
    }

    /// Make `target` a fresh cursor: clear any stale first-visit marker and
    /// result so a re-entered step (retry edge back to a previous task)
    /// starts over instead of being polled.
    fn activate(&self, state: &mut ExecutionState, target: &str) {
        state.step_entered_at.remove(target);
        state.step_results.remove(target);
    }
}

/// If `step_id` is declared as some parallel step's join, the number of
/// branches that must arrive before it activates (its incoming connection
/// count).
fn join_arity(definition: &WorkflowDefinition, step_id: &str) -> Option<u32> {
    let is_join = definition.steps.iter().any(
        |s| matches!(&s.config, StepConfig::Parallel { join } if join == step_id),
    );
    is_join.then(|| definition.incoming(step_id).len() as u32)
}

/// Merge caller bindings with declared defaults and validate types.
fn validate_bindings(
    definition: &WorkflowDefinition,
    mut bindings: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, EngineError> {
    for decl in &definition.variables {
        match bindings.get(&decl.name) {
            Some(value) => {
                if !decl.var_type.matches(value) {
                    return Err(EngineError::TypeMismatch {
                        name: decl.name.clone(),
                        expected: decl.var_type.as_str(),
                    });
                }
            }
            None => {
                if let Some(default) = &decl.default {
                    bindings.insert(decl.name.clone(), default.clone());
                } else if decl.required {
                    return Err(EngineError::MissingRequiredVariable(decl.name.clone()));
                }
            }
        }
    }
    Ok(bindings)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowRepository;
    use crate::workflow::step::TracingIntentSink;
    use crate::workflow::store::DefinitionStore;
    use serde_json::json;
    use stepline_types::workflow::{
        Connection, DefinitionDraft, Permissions, StepDefinition, VariableDecl, VariableType,
    };

    type TestEngine = ExecutionEngine<InMemoryWorkflowRepository, TracingIntentSink>;

    fn fixture() -> (Arc<InMemoryWorkflowRepository>, TestEngine) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = ExecutionEngine::new(repo.clone(), TracingIntentSink);
        (repo, engine)
    }

    fn task(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Task {
                assignee_role: "operator".to_string(),
                estimated_duration_secs: None,
            },
        }
    }

    fn notification(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Notification {
                template_id: format!("{id}-template"),
            },
        }
    }

    fn conn(from: &str, to: &str) -> Connection {
        Connection {
            from: from.to_string(),
            to: to.to_string(),
            guard: None,
            label: None,
        }
    }

    fn guarded(from: &str, to: &str, guard: &str, label: &str) -> Connection {
        Connection {
            from: from.to_string(),
            to: to.to_string(),
            guard: Some(guard.to_string()),
            label: Some(label.to_string()),
        }
    }

    fn draft(
        steps: Vec<StepDefinition>,
        connections: Vec<Connection>,
        variables: Vec<VariableDecl>,
    ) -> DefinitionDraft {
        DefinitionDraft {
            id: None,
            name: "flow".to_string(),
            description: None,
            steps,
            connections,
            triggers: vec![],
            variables,
            permissions: Permissions::default(),
        }
    }

    async fn publish(
        repo: &Arc<InMemoryWorkflowRepository>,
        draft: DefinitionDraft,
    ) -> WorkflowDefinition {
        DefinitionStore::new(repo.clone()).publish(draft).await.unwrap()
    }

    /// Backdate a pending step's entry timestamp so timeout polls fire.
    async fn backdate(
        repo: &Arc<InMemoryWorkflowRepository>,
        instance_id: Uuid,
        step_id: &str,
        secs: i64,
    ) {
        let mut instance = repo.get_instance(&instance_id).await.unwrap().unwrap();
        let entered = instance.state.step_entered_at[step_id] - chrono::Duration::seconds(secs);
        instance
            .state
            .step_entered_at
            .insert(step_id.to_string(), entered);
        repo.update_instance(&instance).await.unwrap();
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_pins_version_and_places_entry_cursor() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;

        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        assert_eq!(instance.definition_version, 1);
        assert_eq!(instance.state.cursors, vec!["a".to_string()]);
        assert_eq!(instance.status, InstanceStatus::Running);

        let log = repo.list_log(&instance.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].message.contains("started by alice"));
    }

    #[tokio::test]
    async fn test_create_rejects_archived_definition() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a")], vec![], vec![]))
            .await;
        DefinitionStore::new(repo.clone()).archive(&def.id).await.unwrap();

        let err = engine.create(def.id, HashMap::new(), "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound));
    }

    #[tokio::test]
    async fn test_missing_required_variable_rejected_before_persist() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![task("a")],
                vec![],
                vec![VariableDecl {
                    name: "device_id".to_string(),
                    var_type: VariableType::String,
                    required: true,
                    default: None,
                }],
            ),
        )
        .await;

        let err = engine.create(def.id, HashMap::new(), "alice").await.unwrap_err();
        match err {
            EngineError::MissingRequiredVariable(name) => assert_eq!(name, "device_id"),
            other => panic!("expected missing variable, got {other}"),
        }
        // Nothing persisted: no instance, no log entries.
        let instances = repo.list_instances(&def.id, None, 10).await.unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn test_binding_type_mismatch_and_defaults() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![task("a")],
                vec![],
                vec![
                    VariableDecl {
                        name: "retries".to_string(),
                        var_type: VariableType::Number,
                        required: false,
                        default: Some(json!(3)),
                    },
                    VariableDecl {
                        name: "region".to_string(),
                        var_type: VariableType::String,
                        required: true,
                        default: None,
                    },
                ],
            ),
        )
        .await;

        let mut bad = HashMap::new();
        bad.insert("region".to_string(), json!(42));
        let err = engine.create(def.id, bad, "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));

        let mut ok = HashMap::new();
        ok.insert("region".to_string(), json!("eu"));
        let instance = engine.create(def.id, ok, "alice").await.unwrap();
        assert_eq!(instance.state.bindings["retries"], json!(3));
    }

    // -----------------------------------------------------------------------
    // advance / idempotence
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_advance_is_idempotent_on_pending_step() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();

        let first = engine.advance(instance.id).await.unwrap();
        assert_eq!(first.state.cursors, vec!["a".to_string()]);
        let log_len = repo.list_log(&instance.id).await.unwrap().len();

        // Second and third advance: no state change, no new log entries.
        let second = engine.advance(instance.id).await.unwrap();
        assert_eq!(second.state.cursors, first.state.cursors);
        engine.advance(instance.id).await.unwrap();
        assert_eq!(repo.list_log(&instance.id).await.unwrap().len(), log_len);
    }

    #[tokio::test]
    async fn test_advance_on_terminal_instance_is_noop() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![notification("n")], vec![], vec![])).await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();

        let done = engine.advance(instance.id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(done.state.cursors.is_empty());
        let log_len = repo.list_log(&instance.id).await.unwrap().len();

        let again = engine.advance(instance.id).await.unwrap();
        assert_eq!(again.status, InstanceStatus::Completed);
        assert_eq!(repo.list_log(&instance.id).await.unwrap().len(), log_len);
    }

    #[tokio::test]
    async fn test_terminal_instance_releases_advance_lock() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![notification("n")], vec![], vec![])).await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();

        engine.advance(instance.id).await.unwrap();
        assert!(engine.locks.is_empty(), "completed instance keeps no lock entry");

        // Polling a terminal instance doesn't re-grow the map.
        engine.advance(instance.id).await.unwrap();
        assert!(engine.locks.is_empty());

        // Cancellation drops the entry too.
        let def = publish(
            &repo,
            draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();
        assert_eq!(engine.locks.len(), 1);
        engine.cancel(instance.id, "alice").await.unwrap();
        assert!(engine.locks.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_status_iff_empty_cursors() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![task("a"), notification("done")],
                vec![conn("a", "done")],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();

        let running = engine.advance(instance.id).await.unwrap();
        assert!(!running.status.is_terminal());
        assert!(!running.state.cursors.is_empty());

        let done = engine
            .report_result(instance.id, "a", "bob", json!({"ok": true}))
            .await
            .unwrap();
        assert!(done.status.is_terminal());
        assert!(done.state.cursors.is_empty());
    }

    // -----------------------------------------------------------------------
    // report_result / routing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_decision_loop_and_completion() {
        // entry task -> review decision: score >= 80 -> report, else back to
        // the task for another attempt.
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    task("attempt"),
                    StepDefinition {
                        id: "review".to_string(),
                        name: "Review".to_string(),
                        config: StepConfig::Decision {},
                    },
                    notification("report"),
                ],
                vec![
                    conn("attempt", "review"),
                    guarded("review", "report", "score >= 80", "pass"),
                    Connection {
                        from: "review".to_string(),
                        to: "attempt".to_string(),
                        guard: None,
                        label: Some("retry".to_string()),
                    },
                ],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        // score 50: decision loops back to the task, which starts fresh.
        let looped = engine
            .report_result(instance.id, "attempt", "bob", json!({"score": 50}))
            .await
            .unwrap();
        assert_eq!(looped.status, InstanceStatus::Running);
        assert_eq!(looped.state.cursors, vec!["attempt".to_string()]);
        assert_eq!(looped.state.step_results["review"], json!("retry"));

        // score 90: decision routes to the report and the instance completes.
        let done = engine
            .report_result(instance.id, "attempt", "bob", json!({"score": 90}))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.state.step_results["review"], json!("pass"));
    }

    #[tokio::test]
    async fn test_report_result_on_wrong_step_rejected() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        // "b" is not active yet.
        let err = engine
            .report_result(instance.id, "b", "bob", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotActive(_)));

        // Unknown step id.
        let err = engine
            .report_result(instance.id, "nope", "bob", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotActive(_)));
    }

    #[tokio::test]
    async fn test_no_matching_transition_fails_instance() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    task("a"),
                    StepDefinition {
                        id: "gate".to_string(),
                        name: "Gate".to_string(),
                        config: StepConfig::Decision {},
                    },
                    notification("end"),
                ],
                vec![conn("a", "gate"), guarded("gate", "end", "score >= 80", "pass")],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let failed = engine
            .report_result(instance.id, "a", "bob", json!({"score": 10}))
            .await
            .unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert!(failed.failure.as_deref().unwrap_or("").contains("NoMatchingTransition"));
        assert!(failed.state.cursors.is_empty());

        let log = repo.list_log(&instance.id).await.unwrap();
        assert!(log.iter().any(|e| e.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_failure_log_carries_step_and_bindings_snapshot() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    task("a"),
                    StepDefinition {
                        id: "gate".to_string(),
                        name: "Gate".to_string(),
                        config: StepConfig::Decision {},
                    },
                    notification("end"),
                ],
                vec![conn("a", "gate"), guarded("gate", "end", "score >= 80", "pass")],
                vec![VariableDecl {
                    name: "region".to_string(),
                    var_type: VariableType::String,
                    required: true,
                    default: None,
                }],
            ),
        )
        .await;

        let mut bindings = HashMap::new();
        bindings.insert("region".to_string(), json!("eu-west"));
        let instance = engine.create(def.id, bindings, "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let failed = engine
            .report_result(instance.id, "a", "bob", json!({"score": 10}))
            .await
            .unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);

        let log = repo.list_log(&instance.id).await.unwrap();
        let error = log
            .iter()
            .find(|e| e.level == LogLevel::Error)
            .expect("error entry");
        assert_eq!(error.step_id.as_deref(), Some("gate"));
        assert!(error.message.contains("NoMatchingTransition"));
        assert!(error.message.contains("bindings snapshot"));
        assert!(error.message.contains("eu-west"));
    }

    #[tokio::test]
    async fn test_invalid_condition_fails_instance() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    task("a"),
                    StepDefinition {
                        id: "gate".to_string(),
                        name: "Gate".to_string(),
                        config: StepConfig::Decision {},
                    },
                    notification("end"),
                ],
                vec![
                    conn("a", "gate"),
                    // Ordering a string against a number is a type error.
                    guarded("gate", "end", "status > 5", "x"),
                ],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let failed = engine
            .report_result(instance.id, "a", "bob", json!({"status": "open"}))
            .await
            .unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert!(failed.failure.as_deref().unwrap_or("").contains("InvalidCondition"));
    }

    // -----------------------------------------------------------------------
    // parallel / join
    // -----------------------------------------------------------------------

    fn parallel_draft() -> DefinitionDraft {
        draft(
            vec![
                task("prep"),
                StepDefinition {
                    id: "fork".to_string(),
                    name: "Fork".to_string(),
                    config: StepConfig::Parallel {
                        join: "merge".to_string(),
                    },
                },
                task("left"),
                task("right"),
                task("merge"),
            ],
            vec![
                conn("prep", "fork"),
                conn("fork", "left"),
                conn("fork", "right"),
                conn("left", "merge"),
                conn("right", "merge"),
            ],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_parallel_join_fires_once_after_all_branches() {
        let (repo, engine) = fixture();
        let def = publish(&repo, parallel_draft()).await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let forked = engine
            .report_result(instance.id, "prep", "bob", json!({}))
            .await
            .unwrap();
        let mut cursors = forked.state.cursors.clone();
        cursors.sort();
        assert_eq!(cursors, vec!["left".to_string(), "right".to_string()]);

        // First branch arrives: join does not activate yet.
        let one_in = engine
            .report_result(instance.id, "right", "bob", json!({"ok": 1}))
            .await
            .unwrap();
        assert_eq!(one_in.state.cursors, vec!["left".to_string()]);
        assert_eq!(one_in.state.join_arrivals.get("merge"), Some(&1));

        // Second branch arrives: join activates exactly once.
        let joined = engine
            .report_result(instance.id, "left", "bob", json!({"ok": 2}))
            .await
            .unwrap();
        assert_eq!(joined.state.cursors, vec!["merge".to_string()]);
        assert!(joined.state.join_arrivals.is_empty());
        assert_eq!(joined.status, InstanceStatus::Running);

        // The merge task itself still needs completing.
        let done = engine
            .report_result(instance.id, "merge", "bob", json!({}))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_branch_order_does_not_matter() {
        let (repo, engine) = fixture();
        let def = publish(&repo, parallel_draft()).await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();
        engine
            .report_result(instance.id, "prep", "bob", json!({}))
            .await
            .unwrap();

        // Left first this time.
        engine
            .report_result(instance.id, "left", "bob", json!({}))
            .await
            .unwrap();
        let joined = engine
            .report_result(instance.id, "right", "bob", json!({}))
            .await
            .unwrap();
        assert_eq!(joined.state.cursors, vec!["merge".to_string()]);
    }

    // -----------------------------------------------------------------------
    // wait / approval timeouts
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_wait_step_times_out_with_result() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    StepDefinition {
                        id: "cooldown".to_string(),
                        name: "Cooldown".to_string(),
                        config: StepConfig::Wait { timeout_secs: 60 },
                    },
                    notification("after"),
                ],
                vec![conn("cooldown", "after")],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        let pending = engine.advance(instance.id).await.unwrap();
        assert_eq!(pending.state.cursors, vec!["cooldown".to_string()]);

        backdate(&repo, instance.id, "cooldown", 120).await;
        let done = engine.advance(instance.id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.state.step_results["cooldown"], json!("timedOut"));
    }

    #[tokio::test]
    async fn test_wait_step_signal_before_timeout() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    StepDefinition {
                        id: "hold".to_string(),
                        name: "Hold".to_string(),
                        config: StepConfig::Wait { timeout_secs: 3600 },
                    },
                    notification("after"),
                ],
                vec![conn("hold", "after")],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let done = engine
            .report_result(instance.id, "hold", "bob", json!("signalled"))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.state.step_results["hold"], json!("signalled"));
    }

    #[tokio::test]
    async fn test_scenario_approval_timeout_auto_rejects() {
        // Approval with a timeout and a rejected-branch: the auto-reject
        // result routes down the rejection guard and logs a warning.
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    StepDefinition {
                        id: "sign-off".to_string(),
                        name: "Sign Off".to_string(),
                        config: StepConfig::Approval {
                            approver_roles: vec!["lead".to_string()],
                            timeout_secs: Some(600),
                        },
                    },
                    notification("approved-path"),
                    notification("rejected-path"),
                ],
                vec![
                    guarded("sign-off", "approved-path", "approved = true", "approved"),
                    Connection {
                        from: "sign-off".to_string(),
                        to: "rejected-path".to_string(),
                        guard: None,
                        label: Some("rejected".to_string()),
                    },
                ],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        backdate(&repo, instance.id, "sign-off", 700).await;
        let done = engine.advance(instance.id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(
            done.state.step_results["sign-off"],
            json!({"approved": false, "auto": true})
        );
        assert!(done.state.step_results.contains_key("rejected-path"));
        assert!(!done.state.step_results.contains_key("approved-path"));

        let log = repo.list_log(&instance.id).await.unwrap();
        assert!(log
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("auto-rejecting")));
    }

    #[tokio::test]
    async fn test_approval_decision_routes_on_result() {
        let (repo, engine) = fixture();
        let def = publish(
            &repo,
            draft(
                vec![
                    StepDefinition {
                        id: "sign-off".to_string(),
                        name: "Sign Off".to_string(),
                        config: StepConfig::Approval {
                            approver_roles: vec!["lead".to_string()],
                            timeout_secs: None,
                        },
                    },
                    notification("approved-path"),
                    notification("rejected-path"),
                ],
                vec![
                    guarded("sign-off", "approved-path", "approved = true", "approved"),
                    Connection {
                        from: "sign-off".to_string(),
                        to: "rejected-path".to_string(),
                        guard: None,
                        label: None,
                    },
                ],
                vec![],
            ),
        )
        .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let done = engine
            .report_result(instance.id, "sign-off", "lead-1", json!({"approved": true}))
            .await
            .unwrap();
        assert!(done.state.step_results.contains_key("approved-path"));
        assert!(!done.state.step_results.contains_key("rejected-path"));
    }

    // -----------------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_cancel_mid_task() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        let cancelled = engine.cancel(instance.id, "alice").await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert!(cancelled.state.cursors.is_empty());
        assert!(cancelled.completed_at.is_some());

        // A late worker result is rejected, not silently absorbed.
        let err = engine
            .report_result(instance.id, "a", "bob", json!({"late": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotRunning(_)));

        // Double cancel is rejected too.
        let err = engine.cancel(instance.id, "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotRunning(_)));

        let log = repo.list_log(&instance.id).await.unwrap();
        assert!(log.iter().any(|e| e.message.contains("cancelled by alice")));
    }

    // -----------------------------------------------------------------------
    // concurrency
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_advances_serialise() {
        let (repo, engine) = fixture();
        let def = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;
        let engine = Arc::new(engine);
        let instance = engine.create(def.id, HashMap::new(), "alice").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let id = instance.id;
            handles.push(tokio::spawn(async move { engine.advance(id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Exactly one "step started" despite eight concurrent advances.
        let log = repo.list_log(&instance.id).await.unwrap();
        let starts = log.iter().filter(|e| e.message.contains("step started")).count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_old_instances_survive_new_version_publish() {
        let (repo, engine) = fixture();
        let store = DefinitionStore::new(repo.clone());
        let v1 = publish(&repo, draft(vec![task("a"), task("b")], vec![conn("a", "b")], vec![]))
            .await;
        let instance = engine.create(v1.id, HashMap::new(), "alice").await.unwrap();
        engine.advance(instance.id).await.unwrap();

        // Publish v2 with a different shape.
        let mut next = draft(vec![task("x")], vec![], vec![]);
        next.id = Some(v1.id);
        store.publish(next).await.unwrap();

        // The in-flight instance still runs against v1's steps.
        let moved = engine
            .report_result(instance.id, "a", "bob", json!({}))
            .await
            .unwrap();
        assert_eq!(moved.definition_version, 1);
        assert_eq!(moved.state.cursors, vec!["b".to_string()]);
    }
}
