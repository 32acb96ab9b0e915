use anyhow::{anyhow, Result};
use aslib_core::{SetupId, TaskId};
use aslib_openml::{OpenmlClient, DEFAULT_API_URL};
use aslib_scenario::{
    describe_coverage, generate_scenario, CoverageSummary, ScenarioSpec, ScenarioSummary,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aslib", version, about = "OpenML ASlib scenario generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a scenario bundle from explicit task and setup ids.
    Generate {
        #[arg(long = "task", required = true)]
        tasks: Vec<TaskId>,
        #[arg(long = "setup", required = true)]
        setups: Vec<SetupId>,
        /// Algorithm name override per setup, `<setup_id>=<name>`. Setups
        /// sharing a name are collapsed into one algorithm.
        #[arg(long = "name")]
        names: Vec<String>,
        #[arg(long, default_value = "predictive_accuracy")]
        measure: String,
        #[arg(long, default_value = "openml-aslib")]
        output_dir: PathBuf,
        #[arg(long, default_value = "Misc")]
        scenario_name: String,
        #[arg(long)]
        require_complete: bool,
        /// Fill value for absent results (defaults to 0; set for minimized
        /// measures).
        #[arg(long)]
        missing_value: Option<f64>,
        #[arg(long, default_value = DEFAULT_API_URL)]
        api_url: String,
        #[arg(long)]
        json: bool,
    },
    /// Generate a scenario bundle from an OpenML study.
    FromStudy {
        #[arg(long)]
        study_id: u64,
        #[arg(long, default_value = "predictive_accuracy")]
        measure: String,
        #[arg(long, default_value = "openml-aslib")]
        output_dir: PathBuf,
        /// Defaults to `Study_<study_id>`.
        #[arg(long)]
        scenario_name: Option<String>,
        #[arg(long)]
        require_complete: bool,
        #[arg(long)]
        missing_value: Option<f64>,
        #[arg(long, default_value = DEFAULT_API_URL)]
        api_url: String,
        #[arg(long)]
        json: bool,
    },
    /// Report evaluation coverage for a request without writing anything.
    Describe {
        #[arg(long = "task", required = true)]
        tasks: Vec<TaskId>,
        #[arg(long = "setup", required = true)]
        setups: Vec<SetupId>,
        #[arg(long = "name")]
        names: Vec<String>,
        #[arg(long, default_value = "predictive_accuracy")]
        measure: String,
        #[arg(long, default_value = DEFAULT_API_URL)]
        api_url: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Generate {
            tasks,
            setups,
            names,
            measure,
            output_dir,
            scenario_name,
            require_complete,
            missing_value,
            api_url,
            json,
        } => {
            let mapping = build_setup_mapping(&setups, &names)?;
            let mut spec = ScenarioSpec::new(tasks, mapping, measure, output_dir, scenario_name);
            spec.require_complete = require_complete;
            if let Some(value) = missing_value {
                spec.missing_value = value;
            }
            let client = OpenmlClient::new(api_url)?;
            let summary = generate_scenario(&client, &spec)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::FromStudy {
            study_id,
            measure,
            output_dir,
            scenario_name,
            require_complete,
            missing_value,
            api_url,
            json,
        } => {
            let client = OpenmlClient::new(api_url)?;
            let study = client.study(study_id)?;
            info!(
                study = study.id,
                tasks = study.tasks.len(),
                setups = study.setups.len(),
                "study resolved"
            );
            let scenario_name =
                scenario_name.unwrap_or_else(|| format!("Study_{}", study.id));
            let mapping = ScenarioSpec::default_setup_names(&study.setups);
            let mut spec =
                ScenarioSpec::new(study.tasks, mapping, measure, output_dir, scenario_name);
            spec.require_complete = require_complete;
            if let Some(value) = missing_value {
                spec.missing_value = value;
            }
            let summary = generate_scenario(&client, &spec)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "from-study",
                    "study_id": study.id,
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Describe {
            tasks,
            setups,
            names,
            measure,
            api_url,
            json,
        } => {
            let mapping = build_setup_mapping(&setups, &names)?;
            // describe never writes, so the output location is irrelevant
            let spec = ScenarioSpec::new(tasks, mapping, measure, "openml-aslib", "Misc");
            let client = OpenmlClient::new(api_url)?;
            let coverage = describe_coverage(&client, &spec)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "coverage": coverage_to_json(&coverage)
                })));
            }
            print_coverage(&coverage);
        }
    }
    Ok(None)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Generate { json, .. }
        | Commands::FromStudy { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn build_setup_mapping(
    setups: &[SetupId],
    names: &[String],
) -> Result<BTreeMap<SetupId, String>> {
    let mut mapping = ScenarioSpec::default_setup_names(setups);
    for raw in names {
        let (id_raw, name) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --name '{}': expected <setup_id>=<name>", raw))?;
        let id: SetupId = id_raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid --name '{}': setup id is not a number", raw))?;
        if name.trim().is_empty() {
            return Err(anyhow!("invalid --name '{}': name cannot be empty", raw));
        }
        if !mapping.contains_key(&id) {
            return Err(anyhow!(
                "invalid --name '{}': setup {} is not in the --setup list",
                raw,
                id
            ));
        }
        mapping.insert(id, name.trim().to_string());
    }
    Ok(mapping)
}

fn summary_to_json(summary: &ScenarioSummary) -> Value {
    json!({
        "scenario_dir": summary.scenario_dir.display().to_string(),
        "tasks": summary.tasks,
        "algorithms": summary.algorithms,
        "features": summary.features,
        "run_rows": summary.run_rows
    })
}

fn print_summary(summary: &ScenarioSummary) {
    println!("scenario_dir: {}", summary.scenario_dir.display());
    println!("tasks: {}", summary.tasks);
    println!("algorithms: {}", summary.algorithms);
    println!("features: {}", summary.features);
    println!("run_rows: {}", summary.run_rows);
}

fn coverage_to_json(coverage: &CoverageSummary) -> Value {
    let cells: Vec<Value> = coverage
        .completeness
        .missing_cells
        .iter()
        .map(|(task, algorithm)| json!({"task": task, "algorithm": algorithm}))
        .collect();
    json!({
        "tasks_requested": coverage.tasks_requested,
        "tasks_obtained": coverage.tasks_obtained,
        "algorithms_requested": coverage.algorithms_requested,
        "algorithms_obtained": coverage.algorithms_obtained,
        "complete": coverage.completeness.is_full(),
        "missing_tasks": coverage.completeness.missing_tasks,
        "missing_algorithms": coverage.completeness.missing_algorithms,
        "missing_cells": cells
    })
}

fn print_coverage(coverage: &CoverageSummary) {
    println!("tasks_requested: {}", coverage.tasks_requested);
    println!("tasks_obtained: {}", coverage.tasks_obtained);
    println!("algorithms_requested: {}", coverage.algorithms_requested);
    println!("algorithms_obtained: {}", coverage.algorithms_obtained);
    println!("complete: {}", coverage.completeness.is_full());
    for task in &coverage.completeness.missing_tasks {
        println!("missing_task: {}", task);
    }
    for algorithm in &coverage.completeness.missing_algorithms {
        println!("missing_algorithm: {}", algorithm);
    }
    for (task, algorithm) in &coverage.completeness.missing_cells {
        println!("missing_result: task {} algorithm {}", task, algorithm);
    }
}
