use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use stagecoach_core::{Executor, Result, StagecoachError, UnitOutcome, Variables};
use tracing::debug;

use crate::config::ExecutorConfig;

/// Runs each unit as an external process built from an argv template.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        if config.command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(StagecoachError::Configuration(
                "executor.command must name a program".into(),
            ));
        }
        Ok(Self {
            argv: config.command.clone(),
            working_dir: config.working_dir.clone(),
        })
    }

    /// Substitute placeholders. Arguments that end up empty are dropped, so
    /// a lone `{seed}` disappears when there is no seed.
    pub fn render(&self, selector: &str, variables: &Variables, seed: Option<u64>) -> Result<Vec<String>> {
        let vars = serde_json::to_string(variables)?;
        let seed = seed.map(|s| s.to_string()).unwrap_or_default();
        Ok(self
            .argv
            .iter()
            .map(|arg| {
                arg.replace("{selector}", selector)
                    .replace("{vars}", &vars)
                    .replace("{seed}", &seed)
            })
            .filter(|arg| !arg.is_empty())
            .collect())
    }
}

impl Executor for CommandExecutor {
    fn execute(&self, selector: &str, variables: &Variables, seed: Option<u64>) -> Result<UnitOutcome> {
        let argv = self.render(selector, variables, seed)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(StagecoachError::Configuration("executor.command rendered empty".into()));
        };

        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        debug!(unit = selector, program = %program, "spawning executor process");

        let started = Instant::now();
        let output = command.output()?;
        Ok(UnitOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            return_code: output.status.code().unwrap_or(-1),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(argv: &[&str]) -> CommandExecutor {
        CommandExecutor::new(&ExecutorConfig {
            command: argv.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
        })
        .unwrap()
    }

    #[test]
    fn renders_placeholders() {
        let exec = executor(&["tool", "run", "--select", "{selector}", "--vars", "{vars}", "{seed}"]);
        let mut vars = Variables::new();
        vars.insert("simulation_year".into(), serde_json::json!(2025));

        let argv = exec.render("stg_people", &vars, Some(17)).unwrap();
        assert_eq!(
            argv,
            vec!["tool", "run", "--select", "stg_people", "--vars", r#"{"simulation_year":2025}"#, "17"]
        );

        let unseeded = exec.render("stg_people", &vars, None).unwrap();
        assert_eq!(unseeded.len(), 6);
    }

    #[test]
    fn rejects_empty_command() {
        let err = CommandExecutor::new(&ExecutorConfig {
            command: Vec::new(),
            working_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, StagecoachError::Configuration(_)));
    }

    #[cfg(unix)]
    #[test]
    fn runs_process_and_captures_output() {
        let exec = executor(&["sh", "-c", "echo ran {selector}; exit 0"]);
        let outcome = exec.execute("dim_levels", &Variables::new(), None).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stdout.trim(), "ran dim_levels");

        let failing = executor(&["sh", "-c", "echo nope >&2; exit 4"]);
        let outcome = failing.execute("x", &Variables::new(), None).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.return_code, 4);
        assert_eq!(outcome.stderr.trim(), "nope");
    }

    #[test]
    fn missing_program_is_an_error() {
        let exec = executor(&["stagecoach-no-such-program-xyz"]);
        assert!(matches!(
            exec.execute("x", &Variables::new(), None),
            Err(StagecoachError::Io(_))
        ));
    }
}
