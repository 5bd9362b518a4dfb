//! Definition graph validation.
//!
//! Runs the full publish-time invariant list over a draft definition and
//! collects every violation instead of stopping at the first, so a caller
//! can fix an invalid document in one pass. Uses `petgraph` for the
//! reachability check.

use std::collections::{HashMap, HashSet};

use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use serde::Serialize;
use stepline_types::workflow::{Connection, StepConfig, StepDefinition, TriggerSpec, VariableDecl};

use super::expression;

/// Upper bound on configured wait/approval timeouts (ten years). Keeps the
/// runtime duration math comfortably inside chrono's representable range.
pub const MAX_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// A single publish-time rule violation.
///
/// `subject` names the offending element (step id, connection, trigger
/// index); `message` says what is wrong with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub subject: String,
    pub message: String,
}

impl Violation {
    fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Validate a draft definition's graph, triggers, and variable declarations.
///
/// Returns the complete violation list; an empty vec means the definition is
/// publishable.
pub fn validate_graph(
    name: &str,
    steps: &[StepDefinition],
    connections: &[Connection],
    triggers: &[TriggerSpec],
    variables: &[VariableDecl],
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        violations.push(Violation::new(
            name,
            "workflow name must be non-empty alphanumeric with hyphens",
        ));
    }

    if steps.is_empty() {
        violations.push(Violation::new(name, "workflow has no steps"));
        return violations;
    }

    // Duplicate step ids.
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            violations.push(Violation::new(&step.id, "duplicate step id"));
        }
    }
    let step_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    // Connection endpoints must reference existing steps.
    for conn in connections {
        if !step_ids.contains(conn.from.as_str()) {
            violations.push(Violation::new(
                format!("{} -> {}", conn.from, conn.to),
                format!("connection source '{}' is not a step", conn.from),
            ));
        }
        if !step_ids.contains(conn.to.as_str()) {
            violations.push(Violation::new(
                format!("{} -> {}", conn.from, conn.to),
                format!("connection target '{}' is not a step", conn.to),
            ));
        }
        if let Some(guard) = &conn.guard
            && let Err(err) = expression::parse(guard)
        {
            violations.push(Violation::new(
                format!("{} -> {}", conn.from, conn.to),
                format!("guard does not parse: {err}"),
            ));
        }
    }

    let incoming_counts = connection_counts(connections, |c| c.to.as_str());
    let outgoing_counts = connection_counts(connections, |c| c.from.as_str());

    // Entry step: exactly one step with zero incoming connections.
    let entries: Vec<&str> = steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| incoming_counts.get(id).copied().unwrap_or(0) == 0)
        .collect();
    match entries.as_slice() {
        [_single] => {}
        [] => violations.push(Violation::new(
            name,
            "no entry step: every step has an incoming connection",
        )),
        many => violations.push(Violation::new(
            many.join(", "),
            "multiple entry steps: more than one step has no incoming connection",
        )),
    }

    // Terminal step: at least one step with zero outgoing connections.
    let has_terminal = steps
        .iter()
        .any(|s| outgoing_counts.get(s.id.as_str()).copied().unwrap_or(0) == 0);
    if !has_terminal {
        violations.push(Violation::new(
            name,
            "no terminal step: every step has an outgoing connection",
        ));
    }

    // Reachability from the entry step.
    if let [entry] = entries.as_slice() {
        for unreachable in unreachable_steps(entry, steps, connections) {
            violations.push(Violation::new(
                unreachable,
                "step is unreachable from the entry step",
            ));
        }
    }

    // Ambiguous unconditional fan-out: two or more unguarded connections
    // leaving the same non-parallel step leave routing undefined.
    for step in steps {
        if matches!(step.config, StepConfig::Parallel { .. }) {
            continue;
        }
        let unconditional = connections
            .iter()
            .filter(|c| c.from == step.id && c.guard.is_none())
            .count();
        if unconditional > 1 {
            violations.push(Violation::new(
                &step.id,
                "more than one unconditional outgoing connection",
            ));
        }
    }

    // Kind-specific configuration rules.
    for step in steps {
        match &step.config {
            StepConfig::Task { assignee_role, .. } => {
                if assignee_role.is_empty() {
                    violations.push(Violation::new(&step.id, "task assignee role is empty"));
                }
            }
            StepConfig::Approval {
                approver_roles,
                timeout_secs,
            } => {
                if approver_roles.is_empty() || approver_roles.iter().any(String::is_empty) {
                    violations.push(Violation::new(
                        &step.id,
                        "approval requires at least one non-empty approver role",
                    ));
                }
                if timeout_secs.is_some_and(|secs| secs > MAX_TIMEOUT_SECS) {
                    violations.push(Violation::new(
                        &step.id,
                        format!("approval timeout exceeds the maximum of {MAX_TIMEOUT_SECS} seconds"),
                    ));
                }
            }
            StepConfig::Parallel { join } => {
                if !step_ids.contains(join.as_str()) {
                    violations.push(Violation::new(
                        &step.id,
                        format!("parallel join step '{join}' does not exist"),
                    ));
                } else if incoming_counts.get(join.as_str()).copied().unwrap_or(0) < 2 {
                    violations.push(Violation::new(
                        &step.id,
                        format!("parallel join step '{join}' needs at least 2 incoming connections"),
                    ));
                }
                if outgoing_counts.get(step.id.as_str()).copied().unwrap_or(0) < 2 {
                    violations.push(Violation::new(
                        &step.id,
                        "parallel step needs at least 2 outgoing connections",
                    ));
                }
            }
            StepConfig::Notification { template_id } => {
                if template_id.is_empty() {
                    violations.push(Violation::new(&step.id, "notification template id is empty"));
                }
            }
            StepConfig::Wait { timeout_secs } => {
                if *timeout_secs > MAX_TIMEOUT_SECS {
                    violations.push(Violation::new(
                        &step.id,
                        format!("wait timeout exceeds the maximum of {MAX_TIMEOUT_SECS} seconds"),
                    ));
                }
            }
            StepConfig::Decision {} => {}
        }
    }

    // Trigger rules.
    for (idx, trigger) in triggers.iter().enumerate() {
        let subject = format!("trigger[{idx}]");
        match trigger {
            TriggerSpec::Scheduled { cron, .. } => {
                if cron.parse::<croner::Cron>().is_err() {
                    violations.push(Violation::new(
                        subject,
                        format!("cron expression '{cron}' does not parse"),
                    ));
                }
            }
            TriggerSpec::Event { event_type, filter } => {
                if event_type.is_empty() {
                    violations.push(Violation::new(subject.clone(), "event type is empty"));
                }
                if let Some(filter) = filter
                    && let Err(err) = expression::parse(filter)
                {
                    violations.push(Violation::new(
                        subject,
                        format!("event filter does not parse: {err}"),
                    ));
                }
            }
            TriggerSpec::Condition { predicate } => {
                if let Err(err) = expression::parse(predicate) {
                    violations.push(Violation::new(
                        subject,
                        format!("condition predicate does not parse: {err}"),
                    ));
                }
            }
            TriggerSpec::Manual {} => {}
        }
    }

    // Variable declaration rules: defaults must match the declared type.
    for var in variables {
        if var.name.is_empty() {
            violations.push(Violation::new("variables", "variable name is empty"));
        }
        if let Some(default) = &var.default
            && !var.var_type.matches(default)
        {
            violations.push(Violation::new(
                &var.name,
                format!("default value does not match declared type {}", var.var_type.as_str()),
            ));
        }
    }

    violations
}

/// The entry step id of a validated definition (zero incoming connections).
pub fn entry_step<'a>(steps: &'a [StepDefinition], connections: &[Connection]) -> Option<&'a str> {
    let incoming = connection_counts(connections, |c| c.to.as_str());
    steps
        .iter()
        .map(|s| s.id.as_str())
        .find(|id| incoming.get(id).copied().unwrap_or(0) == 0)
}

fn connection_counts<'a>(
    connections: &'a [Connection],
    key: impl Fn(&'a Connection) -> &'a str,
) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for conn in connections {
        *counts.entry(key(conn)).or_insert(0) += 1;
    }
    counts
}

/// Steps not reachable from `entry` by following connections forward.
fn unreachable_steps<'a>(
    entry: &str,
    steps: &'a [StepDefinition],
    connections: &[Connection],
) -> Vec<&'a str> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
    for conn in connections {
        if let (Some(&from), Some(&to)) =
            (id_to_idx.get(conn.from.as_str()), id_to_idx.get(conn.to.as_str()))
        {
            graph.add_edge(node_indices[from], node_indices[to], ());
        }
    }

    let Some(&entry_idx) = id_to_idx.get(entry) else {
        return vec![];
    };
    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, node_indices[entry_idx]);
    while let Some(node) = dfs.next(&graph) {
        reached.insert(graph[node]);
    }

    steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !reached.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
