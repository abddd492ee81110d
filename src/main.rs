//! Taskforge CLI Entry Point
//!
//! Runs a YAML plan of shell commands through the phased workflow.
//!
//! # Usage
//!
//! ```bash
//! # Run recon and assessment phases against a target
//! taskforge plan.yaml app.example.com
//!
//! # Authorize exploitation phases for this target
//! taskforge plan.yaml app.example.com --authorize
//!
//! # Dry run mode (preview commands)
//! taskforge plan.yaml app.example.com --dry-run
//!
//! # Resume an interrupted run
//! taskforge plan.yaml app.example.com --checkpoint runs/app.json
//!
//! # Pause between phases while a file exists
//! taskforge plan.yaml app.example.com --pause-flag /tmp/pause.flag
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use taskforge::config::Config;
use taskforge::workflow::{
    ScopeList, WorkflowCheckpoint, WorkflowOrchestrator, WorkflowPlan, WorkflowReport,
};
use taskforge::{APP_NAME, VERSION};

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct Options {
    plan_path: Option<String>,
    target: Option<String>,
    config_path: Option<PathBuf>,
    authorize: bool,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    pause_flag_path: Option<PathBuf>,
    checkpoint_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Phased Workflow Orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: taskforge [OPTIONS] <PLAN_FILE> <TARGET>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>          Path to workflow plan YAML file");
    println!("  <TARGET>             Host, address or domain to run against");
    println!();
    println!("Options:");
    println!("  --target T           Target (instead of the positional argument)");
    println!("  --config PATH        Configuration YAML file");
    println!("  --authorize          Authorize exploitation phases for TARGET");
    println!("  --dry-run            Preview commands without execution");
    println!("  --working-dir PATH   Working directory for commands");
    println!("  --parallel N         Maximum concurrent tasks");
    println!("  --pause-flag PATH    Pause between phases while PATH exists");
    println!("  --checkpoint PATH    Save progress to PATH and resume from it");
    println!("  --report PATH        Write the run report as JSON");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  taskforge plan.yaml 10.0.0.5");
    println!("  taskforge plan.yaml app.example.com --authorize --parallel 8");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into Options.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--authorize" => options.authorize = true,
            "--dry-run" => options.dry_run = true,
            "--verbose" | "-v" => options.verbose = true,
            "--target" | "-t" => {
                options.target = Some(next_value(args, &mut i, arg)?.to_string());
            }
            "--config" => {
                options.config_path = Some(next_value(args, &mut i, arg)?.into());
            }
            "--working-dir" => {
                options.working_dir = Some(next_value(args, &mut i, arg)?.into());
            }
            "--pause-flag" => {
                options.pause_flag_path = Some(next_value(args, &mut i, arg)?.into());
            }
            "--checkpoint" => {
                options.checkpoint_path = Some(next_value(args, &mut i, arg)?.into());
            }
            "--report" => {
                options.report_path = Some(next_value(args, &mut i, arg)?.into());
            }
            "--parallel" => {
                let value = next_value(args, &mut i, arg)?;
                options.max_parallel = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid parallel value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => options.plan_path = Some(arg.clone()),
                    1 if options.target.is_none() => options.target = Some(arg.clone()),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(options)
}

fn load_config(options: &Options) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => {
            info!("Loading configuration: {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };

    if let Some(parallel) = options.max_parallel {
        config.max_concurrent_tasks = parallel;
    }
    config.validate()?;
    Ok(config)
}

fn print_summary(report: &WorkflowReport) {
    println!();
    println!("{}", "Workflow Summary".bold());
    println!("  Target:  {}", report.target);
    println!("  State:   {}", report.state.to_string().green());
    println!("  Elapsed: {:.2?}", report.elapsed);
    println!();

    for phase in &report.phases {
        let status = if phase.all_failed {
            "FAILED".red()
        } else if phase.failed > 0 || !phase.blocked.is_empty() {
            "PARTIAL".yellow()
        } else {
            "OK".green()
        };
        println!(
            "  {:<18} {:<8} {} succeeded, {} failed, {} blocked",
            phase.phase.name(),
            status,
            phase.succeeded,
            phase.failed,
            phase.blocked.len()
        );
        for (name, result) in phase.results.iter().filter(|(_, r)| !r.success) {
            let message = result.error_message().unwrap_or_default();
            println!("      {} {}: {}", "x".red(), name, message.dimmed());
        }
    }
    for skipped in &report.skipped {
        println!(
            "  {:<18} {}",
            skipped.phase.name(),
            format!("skipped ({})", skipped.reason).dimmed()
        );
    }

    println!();
    print!("{}", report.timeline.chart());
    println!();
    println!("{}", report.resource_summary);
    println!(
        "Executor: {} completed, {} failed, {} cancelled ({:.0}% success)",
        report.executor.completed,
        report.executor.failed,
        report.executor.cancelled,
        report.executor.success_rate * 100.0
    );
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let (Some(plan_path), Some(target)) = (options.plan_path.clone(), options.target.clone())
    else {
        print_usage();
        return Err("A plan file and a target are required".into());
    };

    let config = load_config(&options)?;

    let mut plan = WorkflowPlan::load(&plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        format!("Could not load plan from '{}': {}", plan_path, e)
    })?;
    if let Some(dir) = &options.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        plan.working_dir = Some(dir.clone());
    }

    let mut scope = config.authorized_targets.clone();
    if options.authorize {
        scope.push(target.clone());
    }
    let scope = ScopeList::new(scope);
    if scope.is_empty() {
        info!("No authorized targets; exploitation phases will be skipped");
    }

    if options.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let mut orchestrator = WorkflowOrchestrator::from_config(config, Arc::new(scope))?;
    let registered = plan.register(&mut orchestrator, options.dry_run);
    info!(
        "Plan loaded: {} tasks in {} phases",
        plan.task_count(),
        registered
    );

    if let Some(path) = &options.pause_flag_path {
        info!("Pause control: {}", path.display());
        orchestrator = orchestrator.with_pause_flag(path);
    }

    let checkpoint = match &options.checkpoint_path {
        Some(path) => {
            let checkpoint = WorkflowCheckpoint::load_or_new(path, &target)?;
            if checkpoint.target != target {
                return Err(format!(
                    "Checkpoint {} belongs to target '{}'",
                    path.display(),
                    checkpoint.target
                )
                .into());
            }
            orchestrator = orchestrator.with_checkpoint_path(path);
            checkpoint
        }
        None => WorkflowCheckpoint::new(&target),
    };

    let report = orchestrator.run_from_checkpoint(checkpoint)?;
    print_summary(&report);

    if let Some(path) = &options.report_path {
        fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to {}", path.display());
    }

    if report.total_failed() > 0 {
        warn!("{} tasks failed", report.total_failed());
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
