//! The per-cycle state machine of a `diff` resource.
//!
//! Every cycle takes the previously persisted [`ReconciliationState`] (or none,
//! on the first cycle) and the desired values, and produces the next state.
//! The function is pure: persisting the result, or not, is up to the caller,
//! which is what makes preview and apply the same computation.

use serde::{Deserialize, Serialize};
use tracing::info_span;

use crate::{
    expr::{ExpressionContext, Gate, GateError, DEFAULT_COMMIT_EXPRESSION},
    snapshot::{diff, DiffResult, Snapshot},
};

/// The identifier of every `diff` resource instance.
pub const RESOURCE_ID: &str = "diff";

/// The state persisted between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub identifier: String,
    /// Only true for the state produced by the very first cycle.
    pub is_initiated: bool,
    /// The desired snapshot of the cycle that produced this state.
    pub values: Snapshot,
    /// The baseline that cycle's diff was computed against.
    pub last_values: Snapshot,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub commit_expression: String,
    /// Whether the commit expression accepted `values` as the new baseline.
    pub is_committed: bool,
}

impl ReconciliationState {
    /// The baseline the next cycle compares against.
    ///
    /// When the gate accepted, the baseline advances to `values`; otherwise
    /// it stays where it was, so repeated rejected cycles keep measuring
    /// against the same last-accepted point.
    pub fn committed_baseline(&self) -> &Snapshot {
        if self.is_committed {
            &self.values
        } else {
            &self.last_values
        }
    }

    pub fn diff(&self) -> DiffResult {
        DiffResult {
            created: self.created.clone(),
            updated: self.updated.clone(),
            deleted: self.deleted.clone(),
        }
    }
}

/// What the host supplies for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleInput {
    pub values: Snapshot,
    /// Defaults to [`DEFAULT_COMMIT_EXPRESSION`].
    pub commit_expression: Option<String>,
}

impl CycleInput {
    pub fn new(values: Snapshot) -> Self {
        CycleInput {
            values,
            commit_expression: None,
        }
    }

    pub fn with_commit_expression(mut self, expression: impl Into<String>) -> Self {
        self.commit_expression = Some(expression.into());
        self
    }

    pub fn commit_expression(&self) -> &str {
        self.commit_expression
            .as_deref()
            .unwrap_or(DEFAULT_COMMIT_EXPRESSION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Plan-time dry run; the result is not persisted.
    Preview,
    /// The result replaces the stored state.
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// First cycle for a resource instance.
    Initiate,
    /// Any later cycle.
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub mode: Mode,
    pub state: ReconciliationState,
}

/// Compute the next state from `previous` and `input`.
///
/// This is the single entry point behind [`initiate`], [`reconcile`] and
/// [`preview`]. `mode` does not change the computation; it is carried along
/// so that callers and logs can tell a dry run from a real one.
pub fn compute_transition(
    previous: Option<&ReconciliationState>,
    input: &CycleInput,
    gate: &Gate,
    mode: Mode,
) -> Result<Transition, GateError> {
    let (kind, baseline) = match previous {
        None => (TransitionKind::Initiate, Snapshot::new()),
        Some(previous) => (
            TransitionKind::Reconcile,
            previous.committed_baseline().clone(),
        ),
    };
    let is_initiated = kind == TransitionKind::Initiate;

    let span = info_span!("diff cycle", kind = ?kind, mode = ?mode);
    let _enter = span.enter();

    let diff = diff(&input.values, &baseline);
    let commit_expression = input.commit_expression();

    let is_committed = gate
        .evaluate(
            commit_expression,
            &ExpressionContext {
                is_initiated,
                values: &input.values,
                last_values: &baseline,
                diff: &diff,
            },
        )
        .inspect_err(|e| {
            tracing::warn!(tag = e.tag(), error = %e, "commit expression failed");
        })?;

    tracing::info!(
        created = diff.created.len(),
        updated = diff.updated.len(),
        deleted = diff.deleted.len(),
        committed = is_committed,
        "computed diff"
    );

    let DiffResult {
        created,
        updated,
        deleted,
    } = diff;

    Ok(Transition {
        kind,
        mode,
        state: ReconciliationState {
            identifier: RESOURCE_ID.to_string(),
            is_initiated,
            values: input.values.clone(),
            last_values: baseline,
            created,
            updated,
            deleted,
            commit_expression: commit_expression.to_string(),
            is_committed,
        },
    })
}

/// The first cycle of a resource instance.
pub fn initiate(input: &CycleInput, gate: &Gate) -> Result<ReconciliationState, GateError> {
    compute_transition(None, input, gate, Mode::Apply).map(|t| t.state)
}

/// A later cycle, building on `previous`.
pub fn reconcile(
    previous: &ReconciliationState,
    input: &CycleInput,
    gate: &Gate,
) -> Result<ReconciliationState, GateError> {
    compute_transition(Some(previous), input, gate, Mode::Apply).map(|t| t.state)
}

/// What the next cycle would produce, without committing to it.
pub fn preview(
    previous: Option<&ReconciliationState>,
    input: &CycleInput,
    gate: &Gate,
) -> Result<Transition, GateError> {
    compute_transition(previous, input, gate, Mode::Preview)
}
