mod cycle;
mod logging;
mod options;
mod state;

use std::process::exit;

use anyhow::Result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;
use valuesdiff_core::{Error, GateError};

fn main() {
    let args = Args::parse();
    let logger = logging::set_up(&logging::Options {
        verbose: args.options.verbose,
        color: args.options.color_enabled(),
    });
    let mut logger = match logger {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("valuesdiff error: {:#}", e);
            exit(1);
        }
    };
    let r = run_args(args);
    if let Err(e) = logger.tear_down() {
        eprintln!("warning: {:#}", e);
    }
    handle_result(r);
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Plan(subargs) => cycle::plan(&args.options, subargs),
        Commands::Apply(subargs) => cycle::apply(&args.options, subargs),
        Commands::Show { name } => cycle::show(&args.options, name.as_deref()),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "valuesdiff", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// The classification of a failed cycle, if `e` is one.
fn error_tag(e: &anyhow::Error) -> Option<&'static str> {
    e.chain().find_map(|cause| {
        cause
            .downcast_ref::<Error>()
            .map(Error::tag)
            .or_else(|| cause.downcast_ref::<GateError>().map(GateError::tag))
    })
}

fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            match error_tag(&e) {
                Some(tag) => eprintln!("valuesdiff error: [{}] {:#}", tag, e),
                None => eprintln!("valuesdiff error: {:#}", e),
            }
            exit(1);
        }
    }
}

/// valuesdiff: track changes to a set of values, and commit them when an expression allows it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what applying the values would record, without recording it
    Plan(cycle::Args),

    /// Compare the values against the stored baseline and record the result
    Apply(cycle::Args),

    /// Print the recorded state of one or all resources
    Show {
        /// Name of the resource; all resources when omitted
        name: Option<String>,
    },

    /// Generate markdown documentation for valuesdiff
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for valuesdiff
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for valuesdiff
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let args = Args::try_parse_from([
            "valuesdiff",
            "--state",
            "/tmp/s.json",
            "apply",
            "web",
            "--value",
            "k",
            "v",
            "--commit-exp",
            "deleted.length === 0",
            "--max-steps",
            "50",
        ])
        .unwrap();
        assert_eq!(args.options.state, std::path::PathBuf::from("/tmp/s.json"));
        assert_eq!(args.options.limits.to_limits().max_steps, 50);
        assert!(matches!(args.command, Commands::Apply(_)));
    }

    #[test]
    fn test_error_tag() {
        let gate_error = valuesdiff_core::expr::evaluate(
            "((",
            &valuesdiff_core::expr::ExpressionContext {
                is_initiated: true,
                values: &Default::default(),
                last_values: &Default::default(),
                diff: &Default::default(),
            },
        )
        .unwrap_err();
        let e = anyhow::Error::from(Error::from(gate_error)).context("apply failed");
        assert_eq!(error_tag(&e), Some("SyntaxError"));
        assert_eq!(error_tag(&anyhow::anyhow!("other")), None);
    }
}
