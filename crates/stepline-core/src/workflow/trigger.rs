//! Trigger dispatcher: converts external stimuli into workflow instances.
//!
//! Manual starts, scheduler ticks, inbound events, and condition polls all
//! funnel into `engine.create` followed by an immediate `advance`. The
//! dispatcher never owns a clock or a poller; schedule ticks and condition
//! polls arrive from outside.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use stepline_types::workflow::{DefinitionStatus, TriggerSpec, WorkflowInstance};
use thiserror::Error;
use uuid::Uuid;

use super::engine::{EngineError, ExecutionEngine};
use super::expression::{self, EvalContext};
use super::step::IntentSink;
use crate::repository::WorkflowRepository;

/// Errors from trigger dispatch.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The definition has no trigger of the kind being fired.
    #[error("definition {0} has no {1} trigger")]
    NoSuchTrigger(Uuid, &'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Routes trigger firings to the execution engine.
pub struct TriggerDispatcher<R: WorkflowRepository, S: IntentSink> {
    engine: Arc<ExecutionEngine<R, S>>,
    repo: Arc<R>,
}

impl<R: WorkflowRepository, S: IntentSink> TriggerDispatcher<R, S> {
    pub fn new(engine: Arc<ExecutionEngine<R, S>>, repo: Arc<R>) -> Self {
        Self { engine, repo }
    }

    /// Explicit start via CLI or API.
    pub async fn on_manual(
        &self,
        definition_id: Uuid,
        bindings: HashMap<String, Value>,
        actor: &str,
    ) -> Result<WorkflowInstance, TriggerError> {
        let instance = self.engine.create(definition_id, bindings, actor).await?;
        Ok(self.engine.advance(instance.id).await?)
    }

    /// A scheduler tick for one definition. The external clock decides when
    /// to call this; the dispatcher only checks a scheduled trigger exists
    /// on the active version.
    pub async fn on_schedule_tick(
        &self,
        definition_id: Uuid,
    ) -> Result<WorkflowInstance, TriggerError> {
        let has_schedule = self
            .active_triggers(&definition_id)
            .await?
            .iter()
            .any(|t| matches!(t, TriggerSpec::Scheduled { .. }));
        if !has_schedule {
            return Err(TriggerError::NoSuchTrigger(definition_id, "scheduled"));
        }
        let instance = self
            .engine
            .create(definition_id, HashMap::new(), "scheduler")
            .await?;
        Ok(self.engine.advance(instance.id).await?)
    }

    /// Dispatch an inbound event.
    ///
    /// Every active definition with a matching `Event` trigger whose filter
    /// passes spawns an independent instance. Top-level payload fields that
    /// match declared variables become initial bindings. A definition whose
    /// bindings don't validate (for instance a required variable the payload
    /// lacks) is skipped with a warning rather than failing the whole
    /// dispatch.
    pub async fn on_event(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<Vec<WorkflowInstance>, TriggerError> {
        let definitions = self
            .repo
            .list_definitions()
            .await
            .map_err(EngineError::from)?;
        let ctx = EvalContext::from_payload(payload);
        let mut spawned = Vec::new();

        for def in definitions
            .iter()
            .filter(|d| d.status == DefinitionStatus::Active)
        {
            let matched = def.triggers.iter().any(|t| match t {
                TriggerSpec::Event {
                    event_type: wanted,
                    filter,
                } if wanted == event_type => match filter {
                    None => true,
                    // Filter errors are treated as non-matches; a bad filter
                    // on one definition must not block the event for others.
                    Some(filter) => expression::evaluate(filter, &ctx).unwrap_or_else(|err| {
                        tracing::warn!(
                            definition_id = %def.id,
                            error = %err,
                            "event filter failed to evaluate, skipping"
                        );
                        false
                    }),
                },
                _ => false,
            });
            if !matched {
                continue;
            }

            let bindings = bindings_from_payload(payload, def);
            match self.engine.create(def.id, bindings, "event").await {
                Ok(instance) => {
                    let instance = self.engine.advance(instance.id).await?;
                    spawned.push(instance);
                }
                Err(err @ (EngineError::MissingRequiredVariable(_)
                | EngineError::TypeMismatch { .. })) => {
                    tracing::warn!(
                        definition_id = %def.id,
                        event_type = %event_type,
                        error = %err,
                        "event payload does not satisfy workflow variables, skipping"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(
            event_type = %event_type,
            spawned = spawned.len(),
            "event dispatched"
        );
        Ok(spawned)
    }

    /// One cycle of the external condition poller: evaluates every active
    /// definition's `Condition` predicate against the supplied state
    /// snapshot and spawns an instance per match.
    pub async fn on_condition_poll(
        &self,
        snapshot: &Value,
    ) -> Result<Vec<WorkflowInstance>, TriggerError> {
        let definitions = self
            .repo
            .list_definitions()
            .await
            .map_err(EngineError::from)?;
        let ctx = EvalContext::from_payload(snapshot);
        let mut spawned = Vec::new();

        for def in definitions
            .iter()
            .filter(|d| d.status == DefinitionStatus::Active)
        {
            let fired = def.triggers.iter().any(|t| match t {
                TriggerSpec::Condition { predicate } => {
                    expression::evaluate(predicate, &ctx).unwrap_or(false)
                }
                _ => false,
            });
            if !fired {
                continue;
            }

            let bindings = bindings_from_payload(snapshot, def);
            match self.engine.create(def.id, bindings, "condition-poller").await {
                Ok(instance) => spawned.push(self.engine.advance(instance.id).await?),
                Err(err @ (EngineError::MissingRequiredVariable(_)
                | EngineError::TypeMismatch { .. })) => {
                    tracing::warn!(
                        definition_id = %def.id,
                        error = %err,
                        "condition snapshot does not satisfy workflow variables, skipping"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(spawned)
    }

    async fn active_triggers(&self, definition_id: &Uuid) -> Result<Vec<TriggerSpec>, TriggerError> {
        let versions = self
            .repo
            .list_definition_versions(definition_id)
            .await
            .map_err(EngineError::from)?;
        let active = versions
            .into_iter()
            .filter(|d| d.status == DefinitionStatus::Active)
            .max_by_key(|d| d.version)
            .ok_or(EngineError::DefinitionNotFound)?;
        Ok(active.triggers)
    }
}

/// Initial bindings from an event payload: top-level object fields that
/// match a declared variable name.
fn bindings_from_payload(
    payload: &Value,
    definition: &stepline_types::workflow::WorkflowDefinition,
) -> HashMap<String, Value> {
    let mut bindings = HashMap::new();
    if let Value::Object(fields) = payload {
        for decl in &definition.variables {
            if let Some(value) = fields.get(&decl.name) {
                bindings.insert(decl.name.clone(), value.clone());
            }
        }
    }
    bindings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
