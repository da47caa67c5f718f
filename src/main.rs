//! tdecheck CLI - validate MongoDB encryption at rest
//!
//! Runs the readiness, encryption and read/write stages against a node and
//! exits 0 on success, 1 on a failed check and 2 when the node never became
//! ready.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tdecheck::core::config::{patient_record, PATIENT_COMPARE_FIELDS, PATIENT_KEY_FIELD};
use tdecheck::gateway;
use tdecheck::prelude::*;
use tdecheck::validation::stages::EncryptionAtRest;

#[derive(Parser)]
#[command(name = "tdecheck", version, about = "Validate MongoDB encryption at rest")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the full validation pipeline
    Run {
        #[command(flatten)]
        target: Target,

        /// Use the in-process simulated deployment instead of a server
        #[arg(long)]
        simulate: bool,

        /// Maximum readiness status queries
        #[arg(long)]
        attempts: Option<u32>,

        /// Delay between readiness status queries
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Scratch database
        #[arg(long)]
        database: Option<String>,

        /// Scratch collection
        #[arg(long)]
        collection: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check only that encryption at rest is reported active
    Status {
        #[command(flatten)]
        target: Target,

        /// Use the in-process simulated deployment instead of a server
        #[arg(long)]
        simulate: bool,
    },

    /// Insert the sample patient record (kept for a later `read`)
    Insert {
        #[command(flatten)]
        target: Target,
    },

    /// Read the sample patient record back and compare it
    Read {
        #[command(flatten)]
        target: Target,
    },

    /// Write the default configuration file
    InitConfig {
        /// Destination (defaults to ./tdecheck.toml)
        path: Option<PathBuf>,
    },
}

/// Where the deployment is and how to configure the run.
#[derive(Args)]
struct Target {
    /// Configuration file (defaults to ./tdecheck.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// MongoDB connection string
    #[arg(long)]
    uri: Option<String>,
}

impl Target {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config =
            Config::discover(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(uri) = &self.uri {
            config.connection.uri = uri.clone();
        }
        Ok(config)
    }
}

fn connect(config: &Config, simulate: bool) -> anyhow::Result<Box<dyn CommandGateway>> {
    let uri = &config.connection.uri;
    gateway::open(uri, simulate).with_context(|| format!("cannot open a gateway to {}", uri))
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.cmd {
        Cmd::Run {
            target,
            simulate,
            attempts,
            interval_ms,
            database,
            collection,
            json,
        } => {
            let mut config = target.load_config()?;
            if let Some(attempts) = attempts {
                config.replica_set.max_attempts = attempts;
            }
            if let Some(interval_ms) = interval_ms {
                config.replica_set.interval_ms = interval_ms;
            }
            if let Some(database) = database {
                config.exercise.database = database;
            }
            if let Some(collection) = collection {
                config.exercise.collection = collection;
            }

            let gateway = connect(&config, simulate)?;
            let mut pipeline = ValidationPipeline::from_config(&config, Arc::new(ThreadSleeper))
                .context("invalid configuration")?;
            if !json {
                println!("🔐 tdecheck v{}", tdecheck::VERSION);
                pipeline = pipeline.with_progress(Box::new(|update| {
                    if let ProgressUpdate::StageStarted { name, index, total } = update {
                        println!("⏳ [{}/{}] {}...", index + 1, total, name);
                    }
                }));
            }

            let report = pipeline.run(gateway.as_ref());
            if json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        Cmd::Status { target, simulate } => {
            let config = target.load_config()?;
            let gateway = connect(&config, simulate)?;
            let report = EncryptionAtRest::new(config.encryption.clone()).run(gateway.as_ref());
            print_outcome("encryption at rest", &report.outcome);
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        Cmd::Insert { target } => {
            let config = target.load_config()?;
            let gateway = connect(&config, false)?;
            let spec = WriteSpec {
                namespace: config.exercise.namespace(),
                documents: vec![patient_record()],
            };
            let outcome = match ExerciseRunner::new(gateway.as_ref()).write(&spec) {
                Ok(receipt) => Outcome::success(format!(
                    "inserted document {} into {}",
                    receipt.ids.first().map(ToString::to_string).unwrap_or_default(),
                    spec.namespace
                )),
                Err(error) => Outcome::failure(error),
            };
            print_outcome("insert", &outcome);
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Cmd::Read { target } => {
            let config = target.load_config()?;
            let gateway = connect(&config, false)?;
            let namespace = config.exercise.namespace();
            let read = ReadSpec {
                key_field: PATIENT_KEY_FIELD.to_string(),
                compare_fields: PATIENT_COMPARE_FIELDS.iter().map(ToString::to_string).collect(),
            };
            let runner = ExerciseRunner::new(gateway.as_ref());
            let outcome = match runner.read_back(&namespace, &read, &[patient_record()]) {
                Ok(_) => {
                    Outcome::success(format!("patient record in {} read back intact", namespace))
                }
                Err(error) => Outcome::failure(error),
            };
            print_outcome("read", &outcome);
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Cmd::InitConfig { path } => {
            let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            Config::default()
                .save_to(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("📝 Wrote default configuration to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &PipelineReport) {
    println!();
    for (index, entry) in report.entries.iter().enumerate() {
        println!(
            "{} [{}] {}: {} ({}ms)",
            icon(&entry.outcome),
            index + 1,
            entry.stage,
            entry.outcome,
            entry.duration_ms
        );
        for warning in &entry.warnings {
            println!("   ⚠️  {}", warning);
        }
        if let Some(fix) = entry.outcome.error().and_then(StageError::suggested_fix) {
            println!("   💡 {}", fix);
        }
    }
    println!();
    println!(
        "Run {} finished in {}ms: {}",
        report.run_id,
        report.duration_ms,
        report.outcome.label()
    );
}

fn print_outcome(step: &str, outcome: &Outcome) {
    println!("{} {}: {}", icon(outcome), step, outcome);
    if let Some(fix) = outcome.error().and_then(StageError::suggested_fix) {
        println!("   💡 {}", fix);
    }
}

fn icon(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success { .. } => "✅",
        Outcome::Failure { .. } => "❌",
        Outcome::TimedOut { .. } => "⏱️",
    }
}
