//! Self-healing deployment orchestrator.
//!
//! Syncs a worktree with its remote, repairs and checks sources, installs
//! dependencies, validates configuration, and keeps the worker process
//! running under a supervisor. State lives in `<worktree>/.redeploy/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use redeploy::core::report::RunReport;
use redeploy::core::types::SyntaxPolicy;
use redeploy::exit_codes;
use redeploy::io::cancel::{CancelToken, cancel_on_signal, request_cancel};
use redeploy::io::clock::ThreadSleeper;
use redeploy::io::config::{DEFAULT_CONFIG_FILE, DeployConfig, load_config, write_config};
use redeploy::io::formatter::IndentFormatter;
use redeploy::io::git::Git;
use redeploy::io::lock::AlreadyRunningError;
use redeploy::io::packages::PipInstaller;
use redeploy::io::state::StatePaths;
use redeploy::io::supervisor::{LogStream, Pm2Supervisor, Supervisor};
use redeploy::io::syntax::PyCompileChecker;
use redeploy::logging;
use redeploy::pipeline::{Backends, run_deployment};

#[derive(Parser)]
#[command(
    name = "redeploy",
    version,
    about = "Self-healing deployment orchestrator for a supervised worker"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Override the worktree from the config file.
    #[arg(long, global = true)]
    worktree: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full deployment pipeline once.
    Run {
        /// Abort on unrepairable syntax errors (strict) or only warn (lenient).
        #[arg(long, value_enum)]
        syntax_policy: Option<SyntaxPolicy>,
        /// Print the run report as JSON instead of text.
        #[arg(long)]
        json: bool,
        /// Also write the JSON run report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the observed state of the managed process.
    Status,
    /// Print recent worker log lines.
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        #[arg(long, value_enum, default_value_t = LogStream::Err)]
        stream: LogStream,
    },
    /// Ask an in-flight run to stop at its next stage boundary.
    Cancel,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for_error(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<AlreadyRunningError>().is_some() {
        exit_codes::ALREADY_RUNNING
    } else {
        exit_codes::INVALID
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force).map(|()| exit_codes::OK),
        Command::Run {
            syntax_policy,
            json,
            report,
        } => {
            let mut config = load(&cli.config, cli.worktree)?;
            if let Some(policy) = syntax_policy {
                config.syntax_policy = policy;
            }
            cmd_run(&config, json, report.as_deref())
        }
        Command::Status => {
            let config = load(&cli.config, cli.worktree)?;
            cmd_status(&config).map(|()| exit_codes::OK)
        }
        Command::Logs { lines, stream } => {
            let config = load(&cli.config, cli.worktree)?;
            cmd_logs(&config, lines, stream).map(|()| exit_codes::OK)
        }
        Command::Cancel => {
            let config = load(&cli.config, cli.worktree)?;
            cmd_cancel(&config).map(|()| exit_codes::OK)
        }
    }
}

fn load(path: &Path, worktree: Option<PathBuf>) -> Result<DeployConfig> {
    let mut config = load_config(path)?;
    if let Some(worktree) = worktree {
        config.worktree = worktree;
    }
    if !config.worktree.is_dir() {
        bail!("worktree {} is not a directory", config.worktree.display());
    }
    Ok(config)
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &DeployConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_run(config: &DeployConfig, json: bool, report_path: Option<&Path>) -> Result<i32> {
    let limits = config.command_limits();
    let vcs = Git::new(&config.worktree, limits);
    let packages = PipInstaller::new(&config.process.runtime, &config.worktree, limits);
    let syntax = PyCompileChecker::new(&config.process.runtime, &config.worktree, limits);
    let supervisor = supervisor(config);
    let backends = Backends {
        vcs: &vcs,
        packages: &packages,
        formatter: &IndentFormatter,
        syntax: &syntax,
        supervisor: &supervisor,
        sleeper: &ThreadSleeper,
    };
    let cancel = CancelToken::with_sentinel(StatePaths::new(&config.worktree).cancel_path);
    cancel_on_signal(&cancel)?;
    let env = std::env::vars().collect();

    let report = run_deployment(config, backends, cancel, env)?;
    emit_report(&report, json, report_path);
    Ok(report.exit_code())
}

/// Print the report, then save it if asked. A failed save never changes the
/// run's exit code.
fn emit_report(report: &RunReport, json: bool, report_path: Option<&Path>) {
    match (json, report_json(report)) {
        (true, Ok(text)) => println!("{text}"),
        (true, Err(err)) => {
            eprintln!("{err:#}");
            print!("{}", report.render_text());
        }
        (false, _) => print!("{}", report.render_text()),
    }
    if let Some(path) = report_path
        && let Err(err) = write_report(path, report)
    {
        warn!(path = %path.display(), err = %format!("{err:#}"), "could not save run report");
    }
}

fn cmd_status(config: &DeployConfig) -> Result<()> {
    let state = supervisor(config).describe(&config.process.name)?;
    println!("{}: {state}", config.process.name);
    Ok(())
}

fn cmd_logs(config: &DeployConfig, lines: usize, stream: LogStream) -> Result<()> {
    for line in supervisor(config).tail_logs(&config.process.name, lines, stream)? {
        println!("{line}");
    }
    Ok(())
}

fn cmd_cancel(config: &DeployConfig) -> Result<()> {
    let sentinel = StatePaths::new(&config.worktree).cancel_path;
    request_cancel(&sentinel)?;
    println!("cancel requested; an in-flight run stops before its next stage");
    Ok(())
}

fn supervisor(config: &DeployConfig) -> Pm2Supervisor {
    Pm2Supervisor::new(
        &config.supervisor.program,
        &config.worktree,
        config.command_limits(),
    )
}

fn report_json(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("serialize run report")
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let mut buf = report_json(report)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
