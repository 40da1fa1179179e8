use anyhow::Result;
use clap::{Parser, Subcommand};
use edgepick::fetch::Fetcher;
use edgepick::pipeline::{
    RunOptions, TargetOutcome, ValidateOptions, run_succeeded, run_targets, summary_line,
    validate_configs,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edgepick", about = "Ranked endpoint table scraper with top-N output")]
struct Cli {
    #[arg(long, default_value = "configs/targets")]
    config_dir: PathBuf,

    #[arg(long, default_value = "data")]
    out_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run {
        #[arg(long)]
        target: Option<String>,
        /// Select records without writing outputs. Exits 0 when any target
        /// selected records, as a real run would.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Exit non-zero if any single target fails or comes back empty.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Validate {
        #[arg(long)]
        target_file: Option<PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            dry_run,
            strict,
        } => {
            let reports = run_targets(
                &RunOptions {
                    config_dir: cli.config_dir,
                    out_dir: cli.out_dir,
                    target,
                    dry_run,
                },
                &Fetcher::default(),
            )?;

            for report in &reports {
                println!("{}", summary_line(report));
            }

            let produced: usize = reports
                .iter()
                .filter(|r| r.outcome == TargetOutcome::Selected)
                .map(|r| r.records.len())
                .sum();
            let incomplete = reports
                .iter()
                .filter(|r| r.outcome != TargetOutcome::Selected)
                .count();
            info!(
                targets = reports.len(),
                incomplete,
                records = produced,
                "run complete"
            );

            if !run_succeeded(&reports, strict) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Validate { target_file } => {
            let messages = validate_configs(&ValidateOptions {
                config_dir: Some(cli.config_dir),
                target_file,
            })?;
            for line in messages {
                println!("{line}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
