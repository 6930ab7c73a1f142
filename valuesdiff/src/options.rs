use std::{io::IsTerminal as _, path::PathBuf};

use clap::ColorChoice;
use valuesdiff_core::Limits;

#[derive(clap::Args, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The state file holding the resources
    #[arg(
        long,
        global = true,
        env = "VALUESDIFF_STATE",
        default_value = "valuesdiff-state.json"
    )]
    pub state: PathBuf,

    #[command(flatten)]
    pub limits: LimitOptions,
}

impl Options {
    /// Whether log output on stderr should be colored.
    pub fn color_enabled(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}

/// Bounds on commit expression evaluation
#[derive(clap::Args, Debug, Clone)]
pub struct LimitOptions {
    /// Maximum number of evaluation steps
    #[arg(long, global = true, env = "VALUESDIFF_MAX_STEPS", default_value_t = Limits::default().max_steps)]
    pub max_steps: u64,

    /// Maximum depth of nested function calls
    #[arg(long, global = true, env = "VALUESDIFF_MAX_CALL_DEPTH", default_value_t = Limits::default().max_call_depth)]
    pub max_call_depth: usize,

    /// Maximum depth of the evaluation stack, across nested calls
    #[arg(long, global = true, env = "VALUESDIFF_MAX_STACK_DEPTH", default_value_t = Limits::default().max_stack_depth)]
    pub max_stack_depth: usize,

    /// Maximum syntactic nesting of the expression
    #[arg(long, global = true, env = "VALUESDIFF_MAX_NESTING", default_value_t = Limits::default().max_nesting)]
    pub max_nesting: usize,

    /// Maximum length of the expression, in bytes
    #[arg(long, global = true, env = "VALUESDIFF_MAX_SOURCE_LEN", default_value_t = Limits::default().max_source_len)]
    pub max_source_len: usize,

    /// Maximum length of strings built during evaluation, in bytes
    #[arg(long, global = true, env = "VALUESDIFF_MAX_STRING_LEN", default_value_t = Limits::default().max_string_len)]
    pub max_string_len: usize,

    /// Maximum length of arrays built during evaluation
    #[arg(long, global = true, env = "VALUESDIFF_MAX_ARRAY_LEN", default_value_t = Limits::default().max_array_len)]
    pub max_array_len: usize,
}

impl LimitOptions {
    pub fn to_limits(&self) -> Limits {
        Limits {
            max_source_len: self.max_source_len,
            max_nesting: self.max_nesting,
            max_steps: self.max_steps,
            max_call_depth: self.max_call_depth,
            max_stack_depth: self.max_stack_depth,
            max_string_len: self.max_string_len,
            max_array_len: self.max_array_len,
        }
    }
}
