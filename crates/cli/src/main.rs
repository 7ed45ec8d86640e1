mod cli;
mod config;
mod executor;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use stagecoach_core::config::load_dotenv;
use stagecoach_core::{UnitClassifier, Variables};
use stagecoach_engine::{ParallelExecutionEngine, StageRequest};
use stagecoach_graph::{DependencyAnalyzer, ManifestSource};
use stagecoach_resources::ResourceManager;

use crate::cli::{CliArgs, Command, UnitSelection};
use crate::config::CliConfig;
use crate::executor::CommandExecutor;

fn main() -> Result<ExitCode> {
    // Logs go to stderr so JSON on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    load_dotenv();

    let config = CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    config.core.log_summary();

    let resources = Arc::new(ResourceManager::with_system_probes(
        &config.core.resources,
        &config.core.adjuster,
    ));
    let build_engine = || -> Result<ParallelExecutionEngine> {
        let analyzer = build_analyzer(&config, args.no_manifest)?;
        let executor = CommandExecutor::new(&config.executor).context("invalid [executor] section")?;
        let engine = ParallelExecutionEngine::new(
            config.core.engine.clone(),
            Arc::new(analyzer),
            Arc::new(executor),
        )
        .context("failed to start execution engine")?;
        Ok(engine.with_resource_manager(Arc::clone(&resources)))
    };

    match &args.command {
        Command::Health => {
            let status = resources.health_check();
            print_json(&status)?;
            Ok(exit_code(status.healthy))
        }
        Command::Plan(selection) => {
            let engine = build_engine()?;
            let plan = engine.plan(&selected_units(&config, selection), selection.allow_conditional);
            if let Some(cycle) = &plan.ordering_fallback {
                warn!(units = ?cycle.units, "plan contains a dependency cycle, sequential order is input order");
            }
            print_json(&plan)?;
            Ok(exit_code(plan.ordering_fallback.is_none()))
        }
        Command::Stats(selection) => {
            let engine = build_engine()?;
            let stats = engine
                .get_parallelization_statistics(&selected_units(&config, selection), selection.allow_conditional);
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate(selection) => {
            let engine = build_engine()?;
            let units = selected_units(&config, selection);
            let report = engine.analyzer().validate_phase_safety(&units, selection.allow_conditional);
            print_json(&report)?;
            Ok(exit_code(report.safe))
        }
        Command::Run(run) => {
            let engine = build_engine()?;
            let variables: Variables = run.vars.iter().cloned().collect();
            let mut request = StageRequest::new(&run.stage, &[])
                .with_units(selected_units(&config, &run.selection))
                .with_year(run.year)
                .with_variables(variables)
                .allow_conditional(run.selection.allow_conditional);
            if let Some(id) = &run.execution_id {
                request = request.with_execution_id(id);
            }

            resources.start_monitoring().context("failed to start resource monitoring")?;
            let outcome = engine.execute_stage(&request);
            resources.stop_monitoring();

            let result = outcome.with_context(|| format!("stage '{}' could not run", run.stage))?;
            info!(
                stage = %run.stage,
                success = result.success,
                content_hash = %result.content_hash(),
                "stage complete"
            );
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
    }
}

fn build_analyzer(config: &CliConfig, skip_manifest: bool) -> Result<DependencyAnalyzer> {
    let classifier = UnitClassifier::new(&config.core.units).context("invalid classification table")?;
    let mut analyzer = DependencyAnalyzer::new(classifier, &config.core.analyzer);

    let source = ManifestSource::from_config(&config.core.metadata);
    if skip_manifest {
        info!("Manifest disabled, using configured dependencies only");
    } else if source.path().exists() || !config.core.metadata.compile_command.is_empty() {
        analyzer
            .load(&source)
            .with_context(|| format!("failed to load dependency manifest {}", source.path().display()))?;
    } else {
        warn!(
            path = %source.path().display(),
            "No manifest and no compile command, using configured dependencies only"
        );
    }
    Ok(analyzer)
}

fn selected_units(config: &CliConfig, selection: &UnitSelection) -> Vec<String> {
    if selection.units.is_empty() {
        config.core.units.keys().cloned().collect()
    } else {
        selection.units.clone()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to serialize output")?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
