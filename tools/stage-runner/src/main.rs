//! PyFlow stage runner
//!
//! Runs one embedded Python stage over newline-delimited JSON records.
//!
//! # Usage
//!
//! ```bash
//! # Transform records read from stdin
//! pyflow-stage-runner --config stage.toml < records.jsonl
//!
//! # Checkpoint every 1000 records, resuming from the latest checkpoint
//! pyflow-stage-runner --config stage.toml --input records.jsonl \
//!     --checkpoint-every 1000 --restore
//! ```
//!
//! Each output value is written to stdout as one JSON line. Values submitted
//! to output ports through `pyflow_ec.submit` are written as
//! `{"port": n, "value": ...}`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pyflow_core::checkpoint::FileCheckpointStore;
use pyflow_core::config::BridgeConfig;
use pyflow_core::context::{Emitted, LocalContext};
use pyflow_core::logging::Severity;
use pyflow_core::{StageKind, TypedValue};
use pyflow_python::{CheckpointState, PythonStage, SourcePoll};

/// Run a PyFlow Python stage over JSON lines
#[derive(Parser)]
#[command(name = "pyflow-stage-runner")]
#[command(author, version)]
#[command(about = "Run one embedded Python stage over newline-delimited JSON records")]
struct Args {
    /// Stage configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Input records, one JSON value per line (default: stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write a checkpoint after every N records (0 disables)
    #[arg(long, default_value_t = 0)]
    checkpoint_every: u64,

    /// Checkpoint directory (overrides the configuration)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Reset the stage from its latest checkpoint before processing
    #[arg(long)]
    restore: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = BridgeConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let filter = match args.verbose {
        0 => config.logging.level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter)))
        .init();

    if let Some(dir) = args.checkpoint_dir.clone() {
        config.checkpoint.directory = Some(dir);
    }
    if args.checkpoint_every > 0 || args.restore {
        config.checkpoint.enabled = true;
    }

    let context = Arc::new(build_context(&config));
    let stage = PythonStage::from_config(&config, context.clone())?;
    tracing::info!(
        stage = %stage.name(),
        kind = %stage.kind(),
        checkpoint = %stage.checkpoint_state(),
        "Stage loaded"
    );

    let store = match &config.checkpoint.directory {
        Some(dir) => Some(FileCheckpointStore::open(dir)?),
        None => None,
    };
    let mut runner = Runner {
        stage: &stage,
        context: &context,
        store: store.as_ref(),
        every: args.checkpoint_every,
        sequence: 0,
        records: 0,
        out: BufWriter::new(io::stdout().lock()),
    };

    if args.restore {
        runner.restore()?;
    }

    let outcome = if stage.kind() == StageKind::Source {
        runner.drain_source()
    } else {
        let reader: Box<dyn BufRead> = match &args.input {
            Some(path) => Box::new(BufReader::new(
                File::open(path).with_context(|| format!("opening {}", path.display()))?,
            )),
            None => Box::new(io::stdin().lock()),
        };
        runner.run(reader, &config)
    };

    // end of input closes the last window
    let finished = outcome
        .and_then(|_| stage.punctuation().map_err(Into::into))
        .and_then(|_| runner.flush_submitted())
        .and_then(|_| runner.out.flush().map_err(Into::into));
    let records = runner.records;
    drop(runner);
    let shutdown = stage.shutdown();

    tracing::info!(
        records,
        suppressed = stage.suppressed_count(),
        "Stage finished"
    );
    finished?;
    shutdown?;
    Ok(())
}

fn build_context(config: &BridgeConfig) -> LocalContext {
    let threshold = config.logging.level.parse().unwrap_or(Severity::Info);
    let mut context = LocalContext::new(config.stage.name.clone())
        .with_job(config.job.clone())
        .with_threshold(threshold)
        .with_output_ports(config.stage.output_ports.clone());
    for (name, entries) in &config.app_config {
        context = context.with_app_config(name.clone(), entries.clone());
    }
    context
}

struct Runner<'a, W: Write> {
    stage: &'a PythonStage,
    context: &'a LocalContext,
    store: Option<&'a FileCheckpointStore>,
    every: u64,
    sequence: u64,
    records: u64,
    out: W,
}

impl<W: Write> Runner<'_, W> {
    fn run(&mut self, reader: Box<dyn BufRead>, config: &BridgeConfig) -> Result<()> {
        let input_type = config
            .stage
            .input_type
            .as_ref()
            .ok_or_else(|| anyhow!("stage '{}' needs input_type", config.stage.name))?;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let json: serde_json::Value =
                serde_json::from_str(&line).with_context(|| format!("line {}", index + 1))?;
            let value = TypedValue::from_json(&json, input_type)
                .with_context(|| format!("line {}", index + 1))?;

            match self.stage.process(&value) {
                Ok(outputs) => self.emit(&outputs)?,
                Err(err) if err.is_conversion() => {
                    tracing::warn!(line = index + 1, error = %err, "Dropping record");
                }
                Err(err) => return Err(err.into()),
            }
            self.after_record()?;
        }
        Ok(())
    }

    fn drain_source(&mut self) -> Result<()> {
        loop {
            match self.stage.poll_source()? {
                SourcePoll::Value(value) => {
                    self.emit(std::slice::from_ref(&value))?;
                    self.after_record()?;
                }
                SourcePoll::Suppressed => continue,
                SourcePoll::Exhausted => return Ok(()),
            }
        }
    }

    fn emit(&mut self, outputs: &[TypedValue]) -> Result<()> {
        for output in outputs {
            serde_json::to_writer(&mut self.out, &output.to_json())?;
            self.out.write_all(b"\n")?;
        }
        self.flush_submitted()
    }

    fn flush_submitted(&mut self) -> Result<()> {
        for (port, emitted) in self.context.take_emitted() {
            let line = match emitted {
                Emitted::Value(value) => json!({ "port": port, "value": value.to_json() }),
                Emitted::Marker(marker) => json!({ "port": port, "marker": format!("{:?}", marker).to_lowercase() }),
            };
            serde_json::to_writer(&mut self.out, &line)?;
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn after_record(&mut self) -> Result<()> {
        self.records += 1;
        if self.every > 0 && self.records % self.every == 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        let Some(store) = self.store else {
            bail!("checkpointing needs a checkpoint directory");
        };
        if self.stage.checkpoint_state() != CheckpointState::Verified {
            return Ok(());
        }
        self.sequence += 1;
        let mut sink = store.sink(self.stage.name(), self.sequence);
        if self.stage.checkpoint(&mut sink)? {
            tracing::info!(sequence = self.sequence, records = self.records, "Checkpoint written");
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        let Some(store) = self.store else {
            bail!("--restore needs a checkpoint directory");
        };
        let Some(latest) = store.latest(self.stage.name())? else {
            tracing::info!(stage = %self.stage.name(), "No checkpoint to restore");
            return Ok(());
        };
        let mut source = store.source(self.stage.name(), latest);
        if self.stage.reset(&mut source)? {
            self.sequence = latest;
            tracing::info!(sequence = latest, "Stage restored");
        } else {
            tracing::warn!(state = %self.stage.checkpoint_state(), "Stage cannot be restored");
        }
        Ok(())
    }
}
