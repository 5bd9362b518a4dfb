//! Step executors and the outbound intent sink.
//!
//! Every step kind shares one contract: `start` on first activation, `poll`
//! on subsequent visits, both returning an [`ExecutorOutcome`]. The engine
//! owns routing and state; executors only decide whether a step is done,
//! still pending, or failed. Side effects leave the process exclusively
//! through the [`IntentSink`].

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use stepline_types::workflow::{Connection, StepConfig, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use super::expression::{self, EvalContext, EvalError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of starting or polling a step executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorOutcome {
    /// The step finished with a result payload; the engine routes onward.
    Completed(Value),
    /// The step awaits an external completion (result report, signal,
    /// approval, or timeout).
    Pending,
    /// The step failed; the whole instance fails with this reason.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// An outbound side-effect request. Delivery transport lives outside the
/// engine; intents are the only thing that crosses that boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Render-and-send request for a notification step.
    Notification {
        instance_id: Uuid,
        step_id: String,
        template_id: String,
    },
    /// Ask the named roles to approve or reject a pending approval step.
    ApprovalRequest {
        instance_id: Uuid,
        step_id: String,
        approver_roles: Vec<String>,
    },
}

/// Outbound delivery boundary.
///
/// Implementations must not block step progress: a returned error is logged
/// as a warning and execution continues.
pub trait IntentSink: Send + Sync {
    fn deliver(
        &self,
        intent: Intent,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;
}

/// Sink that logs intents via tracing and drops them. Default for serve mode
/// until a real transport is wired in, and handy in tests that don't assert
/// on intents.
#[derive(Debug, Clone, Default)]
pub struct TracingIntentSink;

impl IntentSink for TracingIntentSink {
    async fn deliver(&self, intent: Intent) -> Result<(), String> {
        match &intent {
            Intent::Notification {
                instance_id,
                step_id,
                template_id,
            } => tracing::info!(
                %instance_id,
                step_id = %step_id,
                template_id = %template_id,
                "notification intent emitted"
            ),
            Intent::ApprovalRequest {
                instance_id,
                step_id,
                approver_roles,
            } => tracing::info!(
                %instance_id,
                step_id = %step_id,
                roles = ?approver_roles,
                "approval request intent emitted"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection selection
// ---------------------------------------------------------------------------

/// Pick the outgoing connection to follow after a step completes.
///
/// Guards are evaluated in declaration order against the bindings plus the
/// completing step's result; the first guard evaluating true wins. An
/// unguarded connection matches unconditionally, so placing it last makes it
/// the fallback. `Ok(None)` means no connection matched.
pub fn select_connection<'a>(
    definition: &'a WorkflowDefinition,
    step_id: &str,
    bindings: &HashMap<String, Value>,
    step_result: Option<&Value>,
) -> Result<Option<&'a Connection>, EvalError> {
    let ctx = EvalContext::new(bindings, step_result);
    for conn in definition.outgoing(step_id) {
        match &conn.guard {
            None => return Ok(Some(conn)),
            Some(guard) => {
                if expression::evaluate(guard, &ctx)? {
                    return Ok(Some(conn));
                }
            }
        }
    }
    Ok(None)
}

/// The result a decision step records: the chosen connection's label,
/// falling back to its target step id.
pub fn decision_result(conn: &Connection) -> Value {
    Value::String(conn.label.clone().unwrap_or_else(|| conn.to.clone()))
}

/// Whether `timeout_secs` has elapsed since `entered_at`. Validation bounds
/// configured timeouts, but a timeout too large for chrono never fires
/// rather than wrapping negative.
fn timeout_elapsed(entered_at: DateTime<Utc>, now: DateTime<Utc>, timeout_secs: u64) -> bool {
    i64::try_from(timeout_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .is_some_and(|timeout| now.signed_duration_since(entered_at) >= timeout)
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes individual steps and emits their intents.
pub struct StepRunner<S: IntentSink> {
    sink: S,
}

impl<S: IntentSink> StepRunner<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// First activation of a step.
    ///
    /// `carried_result` is the completing predecessor's result payload; a
    /// decision step's guards see it as the current result context, so a
    /// guard like `score >= 80` can read the field out of the task result
    /// that fed the decision.
    pub async fn start(
        &self,
        instance_id: Uuid,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        bindings: &HashMap<String, Value>,
        carried_result: Option<&Value>,
    ) -> ExecutorOutcome {
        match &step.config {
            // External work: nothing to do until a result is reported.
            StepConfig::Task { .. } => ExecutorOutcome::Pending,

            StepConfig::Decision {} => {
                match select_connection(definition, &step.id, bindings, carried_result) {
                    Ok(Some(conn)) => ExecutorOutcome::Completed(decision_result(conn)),
                    Ok(None) => ExecutorOutcome::Failed(format!(
                        "NoMatchingTransition: no guard matched at decision step '{}'",
                        step.id
                    )),
                    Err(err) => ExecutorOutcome::Failed(format!(
                        "InvalidCondition: guard at decision step '{}' failed: {err}",
                        step.id
                    )),
                }
            }

            // Fan-out is the engine's job; the step itself finishes at once.
            StepConfig::Parallel { .. } => ExecutorOutcome::Completed(Value::Null),

            StepConfig::Wait { .. } => ExecutorOutcome::Pending,

            StepConfig::Notification { template_id } => {
                let intent = Intent::Notification {
                    instance_id,
                    step_id: step.id.clone(),
                    template_id: template_id.clone(),
                };
                if let Err(reason) = self.sink.deliver(intent).await {
                    tracing::warn!(
                        %instance_id,
                        step_id = %step.id,
                        reason = %reason,
                        "notification delivery failed, continuing"
                    );
                }
                ExecutorOutcome::Completed(json!({ "notified": template_id }))
            }

            StepConfig::Approval { approver_roles, .. } => {
                let intent = Intent::ApprovalRequest {
                    instance_id,
                    step_id: step.id.clone(),
                    approver_roles: approver_roles.clone(),
                };
                if let Err(reason) = self.sink.deliver(intent).await {
                    tracing::warn!(
                        %instance_id,
                        step_id = %step.id,
                        reason = %reason,
                        "approval request delivery failed, continuing"
                    );
                }
                ExecutorOutcome::Pending
            }
        }
    }

    /// Re-visit of a step that was left pending.
    pub fn poll(
        &self,
        step: &StepDefinition,
        entered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ExecutorOutcome {
        match &step.config {
            StepConfig::Task { .. } => ExecutorOutcome::Pending,

            StepConfig::Wait { timeout_secs } => {
                if timeout_elapsed(entered_at, now, *timeout_secs) {
                    ExecutorOutcome::Completed(Value::String("timedOut".to_string()))
                } else {
                    ExecutorOutcome::Pending
                }
            }

            StepConfig::Approval { timeout_secs, .. } => match timeout_secs {
                Some(secs) if timeout_elapsed(entered_at, now, *secs) => {
                    ExecutorOutcome::Completed(json!({ "approved": false, "auto": true }))
                }
                _ => ExecutorOutcome::Pending,
            },

            // Decision, parallel and notification never stay pending.
            StepConfig::Decision {}
            | StepConfig::Parallel { .. }
            | StepConfig::Notification { .. } => ExecutorOutcome::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
