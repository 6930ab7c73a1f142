//! Change detection for key/value snapshots, gated by a commit expression.
//!
//! A `diff` resource remembers the last snapshot it accepted. Each cycle
//! compares the desired snapshot against it, hands the result to a small
//! sandboxed expression, and only moves the baseline forward when that
//! expression evaluates to `true`.

mod error;
pub mod expr;
pub mod reconcile;
pub mod snapshot;
pub mod store;

pub use error::Error;
pub use expr::{Gate, GateError, Limits};
pub use reconcile::{CycleInput, Mode, ReconciliationState, Transition, TransitionKind};
pub use snapshot::{diff, DiffResult, Snapshot};
pub use store::{MemoryStore, Reconciler, StateStore};
