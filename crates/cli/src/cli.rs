use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

/// Plan and run stages of transformation units in parallel where it is safe.
#[derive(Parser, Debug)]
#[command(name = "stagecoach", version, about = "Parallel stage scheduler for transformation units")]
pub struct CliArgs {
    /// Path to the TOML config file
    #[arg(long, short, env = "STAGECOACH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Ignore the dependency manifest and use configured dependencies only
    #[arg(long, global = true)]
    pub no_manifest: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the staged execution plan as JSON
    Plan(UnitSelection),
    /// Print parallelization statistics for a set of units
    Stats(UnitSelection),
    /// Check that a set of units may run concurrently (exit 1 if unsafe)
    Validate(UnitSelection),
    /// Print current resource pressure (exit 1 if critical)
    Health,
    /// Execute a stage and print its result (exit 1 on failure)
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct UnitSelection {
    /// Comma-separated unit names (default: every configured unit)
    #[arg(long, value_delimiter = ',')]
    pub units: Vec<String>,

    /// Let conditional units that pass the name heuristic run in parallel
    #[arg(long)]
    pub allow_conditional: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Stage name, used in logs and execution ids
    #[arg(long)]
    pub stage: String,

    /// Simulation year handed to every unit
    #[arg(long)]
    pub year: i32,

    /// Stage variable as key=value; values that parse as JSON keep their type
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, serde_json::Value)>,

    /// Base execution id (random when omitted)
    #[arg(long)]
    pub execution_id: Option<String>,

    #[command(flatten)]
    pub selection: UnitSelection,
}

pub fn parse_var(raw: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("variable name is empty in '{raw}'");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parse_var_keeps_json_types() {
        assert_eq!(parse_var("year=2025").unwrap(), ("year".into(), serde_json::json!(2025)));
        assert_eq!(parse_var("flag=true").unwrap().1, serde_json::json!(true));
        assert_eq!(parse_var("scenario=baseline").unwrap().1, serde_json::json!("baseline"));
        assert_eq!(parse_var("expr=a=b").unwrap().1, serde_json::json!("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn parses_run_subcommand() {
        let args = CliArgs::try_parse_from([
            "stagecoach",
            "run",
            "--stage",
            "foundation",
            "--year",
            "2025",
            "--units",
            "stg_people,dim_levels",
            "--var",
            "scenario=baseline",
            "--allow-conditional",
        ])
        .unwrap();
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.stage, "foundation");
                assert_eq!(run.year, 2025);
                assert_eq!(run.selection.units, vec!["stg_people", "dim_levels"]);
                assert!(run.selection.allow_conditional);
                assert_eq!(run.vars.len(), 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
