use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info_span;
use valuesdiff_core::{CycleInput, Gate, Reconciler, Snapshot, Transition};

use crate::{options::Options, state::FileStore};

#[derive(clap::Args, Debug)]
pub(crate) struct Args {
    /// Name of the resource in the state file
    name: String,

    /// The (whole) desired values, as a JSON object of strings
    #[arg(long("values-json"))]
    values_json: Option<String>,

    /// An individual value
    #[arg(long("value"), num_args = 2, value_names = &["KEY", "VALUE"])]
    value: Vec<String>,

    /// The expression deciding whether the values become the new baseline
    #[arg(long("commit-exp"))]
    commit_exp: Option<String>,
}

impl Args {
    fn to_cycle_input(&self) -> Result<CycleInput> {
        // `--value` pairs may not override `--values-json`: clap does not
        // preserve the relative order of the two flags.
        let mut values: BTreeMap<String, String> = match &self.values_json {
            Some(json) => serde_json::from_str(json)
                .with_context(|| "failed to parse value of --values-json")?,
            None => BTreeMap::new(),
        };
        for pair in self.value.chunks(2) {
            let [k, v] = pair else {
                bail!("--value takes a KEY and a VALUE");
            };
            if values.contains_key(k) {
                bail!("duplicate value: {}", k);
            }
            values.insert(k.clone(), v.clone());
        }
        Ok(CycleInput {
            values: Snapshot::from(values),
            commit_expression: self.commit_exp.clone(),
        })
    }
}

fn reconciler(options: &Options) -> Reconciler<FileStore> {
    Reconciler::new(
        FileStore::new(&options.state),
        Gate::new(options.limits.to_limits()),
    )
}

fn report(transition: &Transition) {
    let state = &transition.state;
    tracing::info!(
        kind = ?transition.kind,
        created = state.created.len(),
        updated = state.updated.len(),
        deleted = state.deleted.len(),
        committed = state.is_committed,
        "diff computed"
    );
}

/// Run the `plan` command.
pub(crate) fn plan(options: &Options, args: &Args) -> Result<()> {
    let span = info_span!("plan", name = %args.name);
    let _enter = span.enter();

    let transition = reconciler(options).preview(&args.name, &args.to_cycle_input()?)?;
    report(&transition);
    print_json(&transition.state)
}

/// Run the `apply` command.
pub(crate) fn apply(options: &Options, args: &Args) -> Result<()> {
    let span = info_span!("apply", name = %args.name);
    let _enter = span.enter();

    let transition = reconciler(options).apply(&args.name, &args.to_cycle_input()?)?;
    report(&transition);
    print_json(&transition.state)
}

/// Run the `show` command.
pub(crate) fn show(options: &Options, name: Option<&str>) -> Result<()> {
    let store = FileStore::new(&options.state);
    match name {
        Some(name) => match reconciler(options).state(name)? {
            Some(state) => print_json(&state),
            None => bail!(
                "no state recorded for resource `{}` in {}",
                name,
                store.path().display()
            ),
        },
        None => print_json(&store.read_resources()?),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values_json: Option<&str>, value: &[&str]) -> Args {
        Args {
            name: "r".to_string(),
            values_json: values_json.map(str::to_string),
            value: value.iter().map(|s| s.to_string()).collect(),
            commit_exp: Some("true".to_string()),
        }
    }

    #[test]
    fn test_values_from_both_flags() {
        let input = args(Some(r#"{"a": "1"}"#), &["b", "2"])
            .to_cycle_input()
            .unwrap();
        assert_eq!(input.values, [("a", "1"), ("b", "2")].into_iter().collect::<Snapshot>());
        assert_eq!(input.commit_expression.as_deref(), Some("true"));
    }

    #[test]
    fn test_duplicate_value() {
        let err = args(Some(r#"{"a": "1"}"#), &["a", "2"])
            .to_cycle_input()
            .unwrap_err();
        assert_eq!(err.to_string(), "duplicate value: a");
    }

    #[test]
    fn test_values_json_must_hold_strings() {
        assert!(args(Some(r#"{"a": 1}"#), &[]).to_cycle_input().is_err());
        assert!(args(Some("[]"), &[]).to_cycle_input().is_err());
    }
}
