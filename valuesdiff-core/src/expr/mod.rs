//! The commit gate: a sandboxed evaluator for one boolean expression.
//!
//! The expression language is a side-effect-free subset of JavaScript
//! expressions. Its only inputs are the six bindings of an
//! [`ExpressionContext`]; there are no statements, no assignment, and no
//! access to anything outside the context. Every evaluation gets a fresh
//! interpreter, and all work is bounded by [`Limits`].
//!
//! ```text
//! is_initiated || created.length + updated.length <= 1
//! deleted.every(k => k.startsWith("tmp-"))
//! ```

mod interp;
mod lexer;
mod parser;
mod value;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::{DiffResult, Snapshot};
use interp::Interpreter;
use parser::{CompileError, Expr};
use value::Value;

/// The commit expression used when the caller does not supply one.
pub const DEFAULT_COMMIT_EXPRESSION: &str = "true";

/// Bounds on what a single evaluation may consume. Violating any of them is a
/// [`GateError::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum length of the expression source, in bytes.
    pub max_source_len: usize,
    /// Maximum syntactic nesting depth.
    pub max_nesting: usize,
    /// Maximum number of evaluation steps (one per visited expression node).
    pub max_steps: u64,
    /// Maximum depth of nested arrow function calls.
    pub max_call_depth: usize,
    /// Maximum number of expression nodes under evaluation at once, counting
    /// the bodies of all active calls.
    pub max_stack_depth: usize,
    /// Maximum length of any string produced during evaluation, in bytes.
    pub max_string_len: usize,
    /// Maximum length of any array produced during evaluation.
    pub max_array_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_source_len: 64 * 1024,
            max_nesting: 64,
            max_steps: 100_000,
            max_call_depth: 64,
            max_stack_depth: 256,
            max_string_len: 1024 * 1024,
            max_array_len: 100_000,
        }
    }
}

/// The read-only bindings visible to a commit expression.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    pub is_initiated: bool,
    /// The desired snapshot.
    pub values: &'a Snapshot,
    /// The baseline the diff was computed against.
    pub last_values: &'a Snapshot,
    /// Exposed as `created`, `updated` and `deleted`.
    pub diff: &'a DiffResult,
}

/// Where and why an expression failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.line, self.column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    TypeError,
    ReferenceError,
    RangeError,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::TypeError => "TypeError",
            FaultKind::ReferenceError => "ReferenceError",
            FaultKind::RangeError => "RangeError",
        })
    }
}

/// The error an expression raised while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Syntax error in `commit_exp`: {0}")]
    Syntax(SyntaxError),
    #[error("Runtime error in `commit_exp`: {0}")]
    Runtime(RuntimeError),
}

impl GateError {
    /// Stable classification for callers and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            GateError::Syntax(_) => "SyntaxError",
            GateError::Runtime(_) => "RuntimeError",
        }
    }

    /// The underlying message, without the classification prefix.
    pub fn detail(&self) -> String {
        match self {
            GateError::Syntax(e) => e.to_string(),
            GateError::Runtime(e) => e.to_string(),
        }
    }
}

/// A parsed commit expression.
///
/// Programs are tied to the thread that compiled them and are meant to be run
/// once, right after compilation.
#[derive(Debug)]
pub struct Program {
    expr: Option<Expr>,
}

impl Program {
    /// Run the program against `context`. Only the boolean `true` accepts.
    pub fn run(&self, context: &ExpressionContext<'_>, limits: &Limits) -> Result<bool, GateError> {
        let expr = match &self.expr {
            Some(expr) => expr,
            None => {
                tracing::debug!("commit expression is empty; rejecting");
                return Ok(false);
            }
        };
        let mut interpreter = Interpreter::new(limits, context);
        let result = interpreter.run(expr).map_err(GateError::Runtime)?;
        let accepted = matches!(result, Value::Bool(true));
        tracing::debug!(
            accepted,
            steps = interpreter.steps(),
            result = result.type_of(),
            "evaluated commit expression"
        );
        Ok(accepted)
    }
}

/// Compiles and evaluates commit expressions under a fixed set of [`Limits`].
///
/// A `Gate` holds no per-evaluation state, so one instance can serve any
/// number of resources and threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gate {
    limits: Limits,
}

impl Gate {
    pub fn new(limits: Limits) -> Self {
        Gate { limits }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn compile(&self, source: &str) -> Result<Program, GateError> {
        if source.len() > self.limits.max_source_len {
            return Err(GateError::Runtime(RuntimeError {
                kind: FaultKind::RangeError,
                message: format!(
                    "Expression source of {} bytes exceeds the limit of {}",
                    source.len(),
                    self.limits.max_source_len
                ),
            }));
        }
        match parser::parse(source, self.limits.max_nesting) {
            Ok(expr) => Ok(Program { expr }),
            Err(CompileError::Syntax(e)) => Err(GateError::Syntax(e)),
            Err(CompileError::TooDeep(limit)) => Err(GateError::Runtime(RuntimeError {
                kind: FaultKind::RangeError,
                message: format!("Expression nesting exceeds the limit of {}", limit),
            })),
        }
    }

    /// Compile `source` and run it against `context`.
    pub fn evaluate(&self, source: &str, context: &ExpressionContext<'_>) -> Result<bool, GateError> {
        self.compile(source)?.run(context, &self.limits)
    }
}

/// Evaluate `source` with the default [`Limits`].
pub fn evaluate(source: &str, context: &ExpressionContext<'_>) -> Result<bool, GateError> {
    Gate::default().evaluate(source, context)
}
