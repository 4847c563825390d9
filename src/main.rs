//! encarch CLI
//!
//! Entry point for the `encarch` command-line tool.

use clap::{Args, Parser, Subcommand};
use encarch::config::{default_config_path, ArchiveConfig, ConfigOverrides};
use encarch::logging::{init_logging, LogConfig};
use encarch::report::{JsonSummarySink, ReportSink, RunReport};
use encarch::run::{ExitCode, RunCoordinator, RunResult};
use encarch::signal::SignalHandler;
use encarch::GpgBackend;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "encarch")]
#[command(about = "Encrypt matching files into a dated archive tree", version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one archive pass (the default)
    Run(RunArgs),

    /// Validate the configuration and print the effective settings
    Verify {
        /// Path to config file (default: /etc/encarch.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Path to config file (default: /etc/encarch.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the configured log level (critical, error, warning, info, debug)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the staging directory
    #[arg(long)]
    temp_base: Option<PathBuf>,

    /// Override the destination root
    #[arg(long)]
    dest_root: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Run(args)) => run_archive(args),
        Some(Commands::Verify { config }) => run_verify(config),
        None => run_archive(cli.run),
    };

    process::exit(code);
}

fn run_archive(args: RunArgs) -> i32 {
    let path = args.config.unwrap_or_else(default_config_path);
    let overrides = ConfigOverrides {
        log_level: args.log_level,
        temp_base: args.temp_base,
        dest_root: args.dest_root,
    };

    let config = match ArchiveConfig::load(&path, &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error in {}: {}", path.display(), e);
            return ExitCode::Config.as_i32();
        }
    };

    if let Err(e) = init_logging(LogConfig {
        level: config.log_level,
        log_file: config.log_file.as_deref(),
    }) {
        eprintln!("Logging setup failed: {}", e);
        return ExitCode::Config.as_i32();
    }

    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        tracing::warn!(error = %e, "failed to install signal handler; cancellation disabled");
    }

    let backend = GpgBackend::new(config.gpg.clone());
    let mut report = RunReport::new(config.instance_name.clone(), config.log_level);

    let result = RunCoordinator::new(&config, &backend, &backend)
        .with_cancel_token(signals.token())
        .run(&mut report);

    deliver_report(&config, report, &result);

    result.exit_code().as_i32()
}

fn deliver_report(config: &ArchiveConfig, report: RunReport, result: &RunResult) {
    let Some(mode) = config.report.mode else {
        return;
    };
    if !mode.should_deliver(result) {
        return;
    }
    let Some(ref path) = config.report.summary_path else {
        return;
    };

    let summary = report.finish(result, &config.report.subject_prefix);
    let sink = JsonSummarySink::new(path);
    match sink.deliver(&summary) {
        Ok(()) => tracing::debug!(path = %path.display(), subject = %summary.subject, "run summary written"),
        Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to write run summary"),
    }
}

fn run_verify(config_path: Option<PathBuf>) -> i32 {
    let path = config_path.unwrap_or_else(default_config_path);

    match ArchiveConfig::load(&path, &ConfigOverrides::default()) {
        Ok(config) => {
            println!("Configuration valid: {}", path.display());
            println!();
            println!("  Instance: {}", config.instance_name);
            println!("  Encrypt to: {}", config.encrypt_to);
            println!("  Source: {} matching {}", config.source_base.display(), config.source_match);
            println!("  Destination: {}/{}", config.dest_root.display(), config.dest_date_format);
            println!("  Pid file: {}", config.pid_file.display());
            match config.temp_base {
                Some(ref temp) => println!(
                    "  Staging: {} ({})",
                    temp.display(),
                    if config.temp_preserve { "preserved" } else { "cleared" }
                ),
                None => println!("  Staging: disabled"),
            }
            println!("  Log level: {}", config.log_level);
            if let Some(ref log_file) = config.log_file {
                println!("  Log file: {}", log_file.display());
            }
            if let (Some(mode), Some(summary)) = (config.report.mode, &config.report.summary_path) {
                println!("  Report: {:?} -> {}", mode, summary.display());
            }
            println!("  GPG binary: {}", config.gpg.binary);
            ExitCode::Success.as_i32()
        }
        Err(e) => {
            eprintln!("Configuration error in {}: {}", path.display(), e);
            ExitCode::Config.as_i32()
        }
    }
}
