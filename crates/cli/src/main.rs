use clap::{Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use sampler_core::catalog::{Catalog, FileRecord};
use sampler_core::config::Config;
use sampler_core::controller::{Controller, RoundReport, RoundRuntime};
use sampler_core::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

#[derive(Parser)]
#[command(name = "sampler", version, about = "Deadline-bound approximate-query controller")]
struct Cli {
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller loop to completion and print the final estimate.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        /// Shell command invoked once per round. Receives `ROUND_MANIFEST`
        /// (paths to read and where to write output) and `STATS_SERVER_ADDR`
        /// (where to push ADD_TIME/ADD_REDUCE messages) as environment
        /// variables, and must print a `{wall_time_ms, avg_record_time_ms,
        /// samples_processed}` JSON object on stdout.
        #[arg(long)]
        round_cmd: String,
        #[arg(long, default_value = "./sampler-round")]
        output_dir: PathBuf,
    },
    /// Parse and sanity-check a config file without running anything.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(log_format: LogFormat, log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .into_diagnostic()?;
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match log_format {
        LogFormat::Json => fmt.json().init(),
        LogFormat::Pretty => fmt.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level)?;

    match cli.command {
        Commands::Run {
            config,
            catalog,
            round_cmd,
            output_dir,
        } => run_command(&config, &catalog, &round_cmd, &output_dir),
        Commands::Validate { config } => validate_command(&config),
    }
}

fn validate_command(config_path: &Path) -> Result<()> {
    tracing::info!(command = "validate", config = %config_path.display());
    let config = load_config(config_path)?;
    config
        .validate()
        .map_err(|e| miette::miette!("{e}"))
        .with_context(|| format!("invalid config at {}", config_path.display()))?;
    println!("Config OK");
    Ok(())
}

fn run_command(
    config_path: &Path,
    catalog_path: &Path,
    round_cmd: &str,
    output_dir: &Path,
) -> Result<()> {
    tracing::info!(command = "run", config = %config_path.display());
    let config = load_config(config_path)?;
    let catalog = load_catalog(catalog_path)?;

    let mut controller = Controller::new(
        config,
        |_collector, port| ProcessRoundRuntime {
            round_cmd: round_cmd.to_string(),
            stats_addr: format!("127.0.0.1:{port}"),
        },
        output_dir,
    )
    .map_err(|e| miette::miette!("{e}"))?;

    let report = controller.run(&catalog).map_err(|e| miette::miette!("{e}"))?;
    write_output(None, &RunReportView::from(report))?;
    Ok(())
}

#[derive(Serialize)]
struct RunReportView {
    estimate: f64,
    error: f64,
    rounds_run: u32,
    deadline_overrun_ms: i64,
}

impl From<sampler_core::controller::RunReport> for RunReportView {
    fn from(report: sampler_core::controller::RunReport) -> Self {
        Self {
            estimate: report.estimate.value,
            error: report.estimate.error,
            rounds_run: report.rounds_run,
            deadline_overrun_ms: report.deadline_overrun_ms,
        }
    }
}

/// Drives one round by shelling out to an operator-supplied command. The
/// actual cluster submission (spinning up mappers/reducers across
/// `datanodes`) lives entirely in that command; this type only knows how
/// to hand it a manifest and parse back a timing report.
struct ProcessRoundRuntime {
    round_cmd: String,
    stats_addr: String,
}

#[derive(Serialize)]
struct RoundManifest {
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    split_size_bytes: u64,
    overrides: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RoundCmdOutput {
    wall_time_ms: f64,
    avg_record_time_ms: f64,
    samples_processed: u64,
}

impl RoundRuntime for ProcessRoundRuntime {
    fn submit_round(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        split_size_bytes: u64,
        overrides: &HashMap<String, String>,
    ) -> std::result::Result<RoundReport, ControllerError> {
        let manifest = RoundManifest {
            inputs: inputs.to_vec(),
            output_dir: output_dir.to_path_buf(),
            split_size_bytes,
            overrides: overrides.clone(),
        };
        let manifest_path = std::env::temp_dir().join(format!(
            "sampler-round-{}.json",
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        let data = serde_json::to_vec(&manifest).map_err(|e| {
            ControllerError::RoundSubmission(format!("failed to encode round manifest: {e}"))
        })?;
        fs::write(&manifest_path, &data).map_err(|e| {
            ControllerError::RoundSubmission(format!("failed to write round manifest: {e}"))
        })?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.round_cmd)
            .env("ROUND_MANIFEST", &manifest_path)
            .env("STATS_SERVER_ADDR", &self.stats_addr)
            .output()
            .map_err(|e| ControllerError::RoundSubmission(format!("round command failed to start: {e}")))?;

        let _ = fs::remove_file(&manifest_path);

        if !output.status.success() {
            return Err(ControllerError::RoundSubmission(format!(
                "round command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let parsed: RoundCmdOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            ControllerError::RoundSubmission(format!(
                "round command produced unparseable output: {e}"
            ))
        })?;

        Ok(RoundReport {
            wall_time_ms: parsed.wall_time_ms,
            avg_record_time_ms: parsed.avg_record_time_ms,
            samples_processed: parsed.samples_processed,
        })
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .into_diagnostic()
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .into_diagnostic()
        .with_context(|| format!("invalid config JSON in {}", path.display()))?;
    config
        .validate()
        .map_err(|e| miette::miette!("{e}"))
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(config)
}

#[derive(Deserialize)]
struct CatalogEntry {
    path: PathBuf,
    size_bytes: u64,
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let contents = fs::read_to_string(path)
        .into_diagnostic()
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(&contents)
        .into_diagnostic()
        .with_context(|| format!("invalid catalog JSON in {}", path.display()))?;
    let files = entries
        .into_iter()
        .map(|e| FileRecord::new(e.path, e.size_bytes))
        .collect();
    Ok(Catalog::new(files))
}

fn write_output<T: Serialize>(path: Option<&PathBuf>, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value).into_diagnostic()?;
    if let Some(path) = path {
        let mut f = fs::File::create(path)
            .into_diagnostic()
            .with_context(|| format!("failed to write output file {}", path.display()))?;
        f.write_all(data.as_bytes()).into_diagnostic()?;
    } else {
        println!("{data}");
    }
    Ok(())
}
