//! Spec-driven AI session supervisor.
//!
//! Drives provider subprocesses (Claude/Codex/Gemini CLIs) through a spec's
//! `tasks.md` checklist until every task is verifiably complete, with crash
//! retry, commit gating, and smart completion detection.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use spec_runner::cancel::CancelToken;
use spec_runner::core::app_state::AppState;
use spec_runner::core::tasks;
use spec_runner::core::types::StateUpdate;
use spec_runner::driver::{Driver, ManagerSessionRunner};
use spec_runner::error::RunnerError;
use spec_runner::exit_codes;
use spec_runner::io::config::{RunnerConfig, load_config};
use spec_runner::io::discovery::{discover_projects, discover_specs};
use spec_runner::io::event_log::EventLogger;
use spec_runner::io::hooks;
use spec_runner::io::persist::load_runner_state;
use spec_runner::io::probe::CliSessionProbe;
use spec_runner::io::provider::ProviderKind;
use spec_runner::io::rescue::CliRescueRunner;
use spec_runner::manager::RunnerManager;
use spec_runner::poller::{StatePoller, update_channel};

#[derive(Parser)]
#[command(
    name = "spec-runner",
    version,
    about = "Drives AI coding sessions through spec task lists"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "spec-runner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the three-phase driver for one spec until done or stalled.
    Run {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        spec: String,
        #[arg(long, default_value = "claude")]
        provider: String,
        /// Model name; defaults to the provider's recommended model.
        #[arg(long)]
        model: Option<String>,
        /// Report what would run without spawning anything.
        #[arg(long)]
        dry_run: bool,
        /// Force refresh of the project discovery cache.
        #[arg(long)]
        refresh_cache: bool,
    },
    /// Validate a spec's task document and print its issues.
    Validate {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        spec: String,
    },
    /// List discovered specs with task progress.
    Specs {
        /// Restrict to one project; defaults to every discovered project.
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long)]
        refresh_cache: bool,
    },
    /// Show persisted runner records.
    Status,
    /// Poll and print state updates until interrupted.
    Monitor,
    /// Remove a stale commit gate left behind by a crashed run.
    Recover {
        #[arg(long)]
        project: PathBuf,
    },
}

fn main() {
    spec_runner::logging::init();
    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    match cli.command {
        Command::Run {
            project,
            spec,
            provider,
            model,
            dry_run,
            refresh_cache,
        } => cmd_run(config, project, spec, provider, model, dry_run, refresh_cache),
        Command::Validate { project, spec } => cmd_validate(config, project, spec),
        Command::Specs {
            project,
            refresh_cache,
        } => cmd_specs(config, project, refresh_cache),
        Command::Status => cmd_status(config),
        Command::Monitor => cmd_monitor(config),
        Command::Recover { project } => cmd_recover(config, project),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: RunnerConfig,
    project: PathBuf,
    spec: String,
    provider: String,
    model: Option<String>,
    dry_run: bool,
    refresh_cache: bool,
) -> Result<i32> {
    let provider = ProviderKind::parse(&provider)?;
    let model = match model {
        Some(model) => {
            if !provider.supported_models().contains(&model.as_str()) {
                eprintln!(
                    "note: model '{model}' is not in the known list for {provider} ({:?})",
                    provider.supported_models()
                );
            }
            model
        }
        None => provider.default_model().to_string(),
    };
    let project = project.canonicalize().unwrap_or(project);
    discover_projects(&config, refresh_cache).ok();

    let tasks_path = config.tasks_path(&project, &spec);
    let text = std::fs::read_to_string(&tasks_path)
        .with_context(|| format!("read {}", tasks_path.display()))?;
    let stats = tasks::parse(&text).stats();
    println!("spec '{spec}': {}", stats.summary());

    if dry_run {
        if stats.is_done() {
            println!("all tasks complete, nothing to run");
        } else {
            println!(
                "would run {provider}/{model} to complete {} remaining task(s)",
                stats.total() - stats.completed
            );
        }
        return Ok(exit_codes::OK);
    }

    let events = EventLogger::new(config.cache_dir.join("events.log"), 5_000_000, 3);
    let manager = Arc::new(RunnerManager::new(config.clone()));
    manager.restore();

    // Background observation: poller publishes, a consumer thread folds.
    let cancel = CancelToken::new();
    let (tx, rx) = update_channel();
    let poller_handle =
        StatePoller::new(config.clone(), manager.clone(), tx).spawn(cancel.clone());
    let consumer = std::thread::spawn(move || {
        let mut state = AppState::new(65_536);
        while let Ok(update) = rx.recv() {
            state.apply(update);
        }
    });

    let session = ManagerSessionRunner::new(manager, provider, model.clone(), cancel.clone());
    let probe = CliSessionProbe::new(
        provider,
        model,
        std::time::Duration::from_secs(config.completion.probe_timeout_s),
    );
    let rescue = CliRescueRunner::new(config.rescue_command.clone());
    let driver = Driver::new(&config, &session, &probe, &rescue, &events, cancel.clone());

    let result = driver.run_to_completion(&project, &spec);

    cancel.cancel();
    poller_handle.join().ok();
    drop(driver);
    consumer.join().ok();

    match result {
        Ok(iterations) => {
            println!("spec '{spec}' complete after {iterations} iteration(s)");
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_driver_error(err)),
    }
}

/// Print the human message plus the stable classifier, and map to the
/// documented exit code. Never a backtrace.
fn report_driver_error(err: anyhow::Error) -> i32 {
    match err.downcast_ref::<RunnerError>() {
        Some(runner_err) => {
            eprintln!("{runner_err}");
            eprintln!("{}", runner_err.classifier());
            match runner_err {
                RunnerError::Stalled { .. } => exit_codes::STALLED,
                RunnerError::TaskFormatInvalid(_) => exit_codes::TASK_FORMAT_INVALID,
                RunnerError::PreconditionFailed(_) => exit_codes::PRECONDITION_FAILED,
                _ => exit_codes::INVALID,
            }
        }
        None => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}

fn cmd_validate(config: RunnerConfig, project: PathBuf, spec: String) -> Result<i32> {
    let tasks_path = config.tasks_path(&project, &spec);
    let text = std::fs::read_to_string(&tasks_path)
        .with_context(|| format!("read {}", tasks_path.display()))?;
    let issues = tasks::validate(&text, &config.mock_patterns());
    let stats = tasks::parse(&text).stats();
    println!("spec '{spec}': {}", stats.summary());
    if issues.is_empty() {
        println!("no issues");
        return Ok(exit_codes::OK);
    }
    let mut has_errors = false;
    for issue in &issues {
        if issue.severity == tasks::Severity::Error {
            has_errors = true;
        }
        println!(
            "line {} [{:?}] {}",
            issue.line, issue.severity, issue.message
        );
    }
    Ok(if has_errors {
        exit_codes::TASK_FORMAT_INVALID
    } else {
        exit_codes::OK
    })
}

fn cmd_specs(config: RunnerConfig, project: Option<PathBuf>, refresh_cache: bool) -> Result<i32> {
    let projects = match project {
        Some(project) => vec![project],
        None => discover_projects(&config, refresh_cache)?,
    };
    for project in projects {
        println!("{}", project.display());
        for (name, path) in discover_specs(&config, &project)? {
            let tasks_path = path.join(&config.tasks_filename);
            match std::fs::read_to_string(&tasks_path) {
                Ok(text) => {
                    let stats = tasks::parse(&text).stats();
                    println!("  {name:<40} {}", stats.summary());
                }
                Err(_) => println!("  {name:<40} (no {})", config.tasks_filename),
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_status(config: RunnerConfig) -> Result<i32> {
    let state = load_runner_state(&config.runner_state_path());
    if state.runners.is_empty() {
        println!("no persisted runners");
        return Ok(exit_codes::OK);
    }
    for record in &state.runners {
        println!(
            "{} {:<10} {:<24} pid={} retries={}/{} {}",
            record.id,
            format!("{:?}", record.status).to_lowercase(),
            record.spec_name,
            record.pid,
            record.retry_count,
            record.max_retries,
            record.project_path.display(),
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_monitor(config: RunnerConfig) -> Result<i32> {
    let manager = Arc::new(RunnerManager::new(config.clone()));
    manager.restore();
    let cancel = CancelToken::new();
    let (tx, rx) = update_channel();
    let _handle = StatePoller::new(config, manager, tx).spawn(cancel.clone());

    while let Ok(update) = rx.recv() {
        match update {
            StateUpdate::TaskCountsChanged { spec, stats } => {
                println!("[tasks] {spec} {}", stats.summary());
            }
            StateUpdate::LogAppended { spec, tail } => {
                let trimmed = tail.trim_end();
                if !trimmed.is_empty() {
                    for line in trimmed.lines().rev().take(3).collect::<Vec<_>>().iter().rev() {
                        println!("[log] {spec} {line}");
                    }
                }
            }
            StateUpdate::CommitObserved { spec, hash, subject } => {
                println!("[commit] {spec} {} {subject}", &hash[..hash.len().min(8)]);
            }
            StateUpdate::RunnerStatusChanged {
                runner_id,
                status,
                exit_code,
            } => {
                println!("[runner] {runner_id} {status:?} exit={exit_code:?}");
            }
            StateUpdate::ProjectSetChanged { projects } => {
                println!("[projects] {} project(s)", projects.len());
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_recover(config: RunnerConfig, project: PathBuf) -> Result<i32> {
    let recovered = hooks::recover_stale(&project)?;
    if recovered {
        let events = EventLogger::new(config.cache_dir.join("events.log"), 5_000_000, 3);
        events.info(
            "commit_gate_recovered",
            serde_json::json!({"project": project.display().to_string()}),
        );
        println!("removed stale commit gate in {}", project.display());
    } else {
        println!("no stale commit gate in {}", project.display());
    }
    Ok(exit_codes::OK)
}
