//! titan: run code in kernel sessions from the command line.
//!
//! Usage:
//!   # List the registered kernel specs
//!   titan specs
//!
//!   # Start a python3 session and run two cells
//!   titan run --spec python3 '1+1' 'plot(df)'
//!
//!   # Pinned clock/ids/entropy, every flow event, telemetry at the end
//!   titan --deterministic run --flows --telemetry 'raise Boom'
//!
//! Outputs and results are printed to stdout as JSON lines; logs go to
//! stderr (`RUST_LOG=titan_kernel=debug` for lifecycle detail).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt};

use titan_kernel::{ExecuteOptions, KernelConfig, KernelHost, ManualClock, Sources};
use titan_types::ExecutionResult;

/// Kernel session runner.
#[derive(Parser, Debug)]
#[command(name = "titan")]
#[command(about = "Run code in titan kernel sessions")]
struct Args {
    /// Kernel config (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pin the clock, ids, and entropy so runs are reproducible
    #[arg(long, global = true)]
    deterministic: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered kernel specs
    Specs,

    /// Start a session and execute each code cell in order
    Run {
        /// Kernel spec name
        #[arg(short, long, default_value = "python3")]
        spec: String,

        /// Notebook the session is bound to
        #[arg(long, default_value = "scratch")]
        notebook: String,

        /// Owning user
        #[arg(long, default_value = "cli")]
        user: String,

        /// Per-cell timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print every flow event instead of just outputs and results
        #[arg(long)]
        flows: bool,

        /// Dump recent telemetry after the run
        #[arg(long)]
        telemetry: bool,

        /// Code cells
        #[arg(required = true)]
        cells: Vec<String>,
    },
}

fn print_line(value: &serde_json::Value) {
    println!("{value}");
}

fn print_result(cell: usize, result: &ExecutionResult, with_outputs: bool) -> Result<()> {
    if with_outputs {
        for output in &result.outputs {
            print_line(&json!({ "kind": "output", "cell": cell, "output": output }));
        }
    }
    let mut summary = serde_json::to_value(result).context("serialize result")?;
    if let Some(map) = summary.as_object_mut() {
        map.remove("outputs");
    }
    print_line(&json!({ "kind": "result", "cell": cell, "result": summary }));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => KernelConfig::default(),
    };
    let sources = if args.deterministic {
        Sources::deterministic(Arc::new(ManualClock::new(0)), 0.5)
    } else {
        Sources::system()
    };
    let host = KernelHost::new(config, sources);

    match args.command {
        Command::Specs => {
            for spec in host.list_specs() {
                print_line(&serde_json::to_value(spec.as_ref())?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            spec,
            notebook,
            user,
            timeout_ms,
            flows,
            telemetry,
            cells,
        } => {
            let mut events = host.flows().subscribe("kernel.>");
            let session = host
                .start_kernel(notebook, user, &spec)
                .with_context(|| format!("starting {spec} kernel"))?;
            tracing::info!(session = %session.id, spec = %spec, "Session ready");

            let mut failures = 0usize;
            for (index, code) in cells.into_iter().enumerate() {
                let mut options = ExecuteOptions::default().with_cell_id(format!("cell-{index}"));
                if let Some(ms) = timeout_ms {
                    options = options.with_timeout(Duration::from_millis(ms));
                }
                let result = host.execute(session.id, code, options).await?;
                if !result.is_success() {
                    failures += 1;
                }
                if flows {
                    for msg in events.drain() {
                        print_line(&json!({ "kind": "flow", "subject": msg.subject, "event": msg.payload }));
                    }
                } else {
                    events.drain();
                }
                print_result(index, &result, !flows)?;
            }

            host.terminate(session.id)?;
            if flows {
                for msg in events.drain() {
                    print_line(&json!({ "kind": "flow", "subject": msg.subject, "event": msg.payload }));
                }
            }
            if telemetry {
                let retention = host.telemetry().retention();
                for event in host.telemetry().recent_events(retention) {
                    print_line(&json!({ "kind": "telemetry", "event": event }));
                }
            }

            Ok(if failures == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
