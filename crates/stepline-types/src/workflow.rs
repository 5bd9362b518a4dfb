//! Workflow domain types for Stepline.
//!
//! Defines the canonical workflow definition model (steps, connections,
//! triggers, variable declarations), instance execution tracking
//! (`WorkflowInstance`, `ExecutionState`) and the append-only
//! `ExecutionLogEntry` audit record. Definitions are immutable once
//! published; instances pin the (id, version) pair they were created against.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A published, versioned workflow definition.
///
/// Immutable after publish: editing a workflow means publishing a new version
/// under the same `id`. In-flight instances keep executing against the
/// version they were created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first publish; shared across versions.
    pub id: Uuid,
    /// Human-readable workflow name (alphanumeric + hyphens).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version number per `id`, assigned by the store on publish.
    pub version: u32,
    /// Lifecycle status. Only `Active` definitions accept new instances.
    pub status: DefinitionStatus,
    /// Ordered step definitions. Declaration order matters for guard
    /// evaluation on a step's outgoing connections.
    pub steps: Vec<StepDefinition>,
    /// Directed edges between steps, optionally guarded.
    pub connections: Vec<Connection>,
    /// Trigger configurations (manual, scheduled, event, condition).
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    /// Declared instance variables with type and required/default info.
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Role-name lists for execute/modify/view permission checks
    /// (enforcement is an external collaborator).
    #[serde(default)]
    pub permissions: Permissions,
    /// When this version was published.
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Outgoing connections of a step, in declaration order.
    pub fn outgoing(&self, step_id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.from == step_id).collect()
    }

    /// Incoming connections of a step, in declaration order.
    pub fn incoming(&self, step_id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.to == step_id).collect()
    }
}

/// Lifecycle status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Unpublished working copy (never stored by the definition store).
    Draft,
    /// Published and accepting new instances.
    Active,
    /// Retired: existing instances keep running, no new instances, triggers
    /// disabled.
    Archived,
}

/// A draft definition document as submitted to `publish`.
///
/// The store assigns `id` (when absent), `version`, `status` and
/// `created_at`; everything else is caller-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDraft {
    /// Present when publishing a new version of an existing workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default)]
    pub permissions: Permissions,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single typed step within a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step id (e.g. "triage-review"). Unique within a definition.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Kind-specific configuration payload.
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }
}

/// The kind of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Task,
    Decision,
    Parallel,
    Wait,
    Notification,
    Approval,
}

impl StepKind {
    /// `snake_case` label used in log messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Task => "task",
            StepKind::Decision => "decision",
            StepKind::Parallel => "parallel",
            StepKind::Wait => "wait",
            StepKind::Notification => "notification",
            StepKind::Approval => "approval",
        }
    }
}

/// Kind-tagged step configuration.
///
/// Internally tagged by `type` to match the definition document structure:
/// ```yaml
/// config:
///   type: task
///   assignee_role: field-engineer
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Work item completed externally by a member of `assignee_role`.
    Task {
        assignee_role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_duration_secs: Option<u64>,
    },
    /// Branch point: guards on the outgoing connections select the path.
    Decision {},
    /// Fan out on every outgoing connection; branches rendezvous at `join`.
    Parallel { join: String },
    /// Suspend until a signal arrives or `timeout_secs` elapses.
    Wait { timeout_secs: u64 },
    /// Emit a notification intent and continue immediately.
    Notification { template_id: String },
    /// Human approval gate; auto-rejects after `timeout_secs` if configured.
    Approval {
        approver_roles: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Task { .. } => StepKind::Task,
            StepConfig::Decision {} => StepKind::Decision,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Wait { .. } => StepKind::Wait,
            StepConfig::Notification { .. } => StepKind::Notification,
            StepConfig::Approval { .. } => StepKind::Approval,
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A directed edge between two steps.
///
/// For decision steps, guards are evaluated in declaration order; the first
/// guard evaluating true wins, with an unconditional connection as fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Source step id.
    pub from: String,
    /// Target step id.
    pub to: String,
    /// Optional boolean guard expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Optional branch label, recorded as the decision result when taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// External stimulus that spawns a new instance of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Triggered explicitly via CLI or API.
    Manual {},
    /// Fired by an external scheduler clock.
    Scheduled {
        /// Cron expression (validated on publish).
        cron: String,
        /// Optional IANA timezone name (e.g. "America/New_York").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fired by a matching inbound event.
    Event {
        /// Event type to match.
        event_type: String,
        /// Optional filter expression evaluated against the event payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    /// Fired when an externally polled predicate becomes true.
    Condition { predicate: String },
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Declared instance variable with type, required flag and default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    /// Default value applied when the caller supplies no binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Value type of a declared variable. Dates are RFC 3339 strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Date,
}

impl VariableType {
    /// Whether a JSON value is acceptable for this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::Number => value.is_number(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Date => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Number => "number",
            VariableType::Boolean => "boolean",
            VariableType::Date => "date",
        }
    }
}

/// Role-name lists for permission checks. Enforcement is external; the
/// definition only declares who may do what.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub execute: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub view: Vec<String>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    /// Definition this instance executes.
    pub definition_id: Uuid,
    /// Version pinned at creation; later publishes never affect this instance.
    pub definition_version: u32,
    pub status: InstanceStatus,
    /// Mutable execution state (cursors, bindings, step results).
    pub state: ExecutionState,
    /// Resolved actor identity that created the instance.
    pub initiated_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason when status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl WorkflowInstance {
    /// The single current step outside parallel regions.
    pub fn current_step(&self) -> Option<&str> {
        self.state.cursors.first().map(String::as_str)
    }
}

/// Mutable per-instance execution state, persisted as a JSON blob.
///
/// `cursors` is the set of active step ids: one entry in linear flow,
/// several inside a parallel region, empty exactly when the instance is
/// terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Active branch cursors (step ids).
    pub cursors: Vec<String>,
    /// Variable bindings, validated against the definition's declarations.
    pub bindings: HashMap<String, Value>,
    /// Result payload per completed step.
    #[serde(default)]
    pub step_results: HashMap<String, Value>,
    /// First-visit timestamp per step; drives start-vs-poll dispatch and
    /// wait/approval deadlines.
    #[serde(default)]
    pub step_entered_at: HashMap<String, DateTime<Utc>>,
    /// Branches arrived per join step inside an open parallel region.
    #[serde(default)]
    pub join_arrivals: HashMap<String, u32>,
}

// ---------------------------------------------------------------------------
// Execution log
// ---------------------------------------------------------------------------

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Append-only audit record for a single instance.
///
/// `seq` is a per-instance logical sequence number assigned by the log;
/// ordering is by `seq`, never wall clock, to tolerate clock skew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub instance_id: Uuid,
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub logged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
