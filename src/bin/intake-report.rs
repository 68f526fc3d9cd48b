#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use intake_report::orchestrator::{create_report, import_stage};
use intake_report::{
    share_url, IntakeData, JsonlTraceSink, PipelineConfig, PipelineError, PipelineOrchestrator,
    Report, ReportStatus, StageId, StageRunner, StoreBackend, TraceSink,
};

#[derive(Parser)]
#[command(
    name = "intake-report",
    version,
    about = "Turn a business intake questionnaire into a client report"
)]
struct Cli {
    /// SQLite report store (overrides REPORT_STORE_PATH / REPORT_STORE_URL)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Base URL for share links (overrides REPORT_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new pending report from an intake JSON file
    Create {
        #[arg(long)]
        intake: PathBuf,
    },
    /// Run the remaining stages of a report, resuming after the last stored one
    Run {
        #[arg(long)]
        report: String,
        /// Stop after this stage (number or name)
        #[arg(long)]
        through: Option<StageId>,
        /// Write each stored stage output as JSON into this directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Append per-attempt stage traces as JSONL
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// Validate and store an externally produced output for the next stage
    ImportStage {
        #[arg(long)]
        report: String,
        #[arg(long)]
        stage: StageId,
        #[arg(long)]
        input: PathBuf,
    },
    /// Print a report's progress
    Status {
        #[arg(long)]
        report: String,
        /// Print the full stored report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn write_stage_outputs(report: &Report, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    for stage in StageId::ALL {
        if let Some(output) = report.stage_output(stage) {
            let name = format!("stage{}_{}.json", stage.number(), stage.as_str());
            write_json(&dir.join(name), output)?;
        }
    }
    write_json(&dir.join("report.json"), report)?;
    Ok(())
}

fn print_status(report: &Report, base_url: &str) {
    println!("report:   {}", report.id);
    println!("status:   {} ({}/4)", report.status, report.status.progress());
    for stage in StageId::ALL {
        let mark = if report.stage_output(stage).is_some() {
            "done"
        } else {
            "-"
        };
        println!("  {stage}: {mark}");
    }
    if report.status == ReportStatus::Completed {
        if let Some(token) = &report.share_token {
            println!("share:    {}", share_url(base_url, token));
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[x] interrupt received; abandoning the in-flight stage");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(path) = cli.store {
        config.store = StoreBackend::Sqlite(path);
    }
    if let Some(base_url) = cli.base_url {
        config.report_base_url = base_url;
    }

    match cli.command {
        Commands::Create { intake } => {
            let text = std::fs::read_to_string(&intake)?;
            let intake = IntakeData::parse(&text)?;
            let store = config.open_store()?;
            let report = create_report(store.as_ref(), &intake).await?;
            println!("{}", report.id);
            if let Some(token) = &report.share_token {
                eprintln!(
                    "[x] share link (live once completed): {}",
                    share_url(&config.report_base_url, token)
                );
            }
        }
        Commands::ImportStage {
            report,
            stage,
            input,
        } => {
            let text = std::fs::read_to_string(&input)?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let store = config.open_store()?;
            let report = import_stage(store.as_ref(), &report, stage, &value).await?;
            println!("{} {}", report.id, report.status);
        }
        Commands::Run {
            report,
            through,
            out_dir,
            trace,
        } => {
            let store = config.open_store()?;
            let client = config.completion_client()?;

            let (trace_sink, trace_worker) = if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                (Some(Arc::new(sink)), Some(worker))
            } else {
                (None, None)
            };

            let mut runner = StageRunner::new(client).with_config(config.runner.clone());
            if let Some(sink) = &trace_sink {
                let sink: Arc<dyn TraceSink> = sink.clone();
                runner = runner.with_trace_sink(sink);
            }
            let orchestrator = PipelineOrchestrator::new(runner, store.clone())
                .with_cancellation(cancel_on_ctrl_c());

            let last = through.unwrap_or(StageId::ReportGeneration);
            eprintln!("[x] running {} through {}", report, last);
            let result = orchestrator.run_through(&report, last).await;

            drop(orchestrator);
            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            let finished = match result {
                Ok(report) => report,
                Err(err) => {
                    if err.is_retryable() {
                        eprintln!(
                            "[x] {} failed ({}); run again to resume",
                            stage_label(&err),
                            err.code()
                        );
                    }
                    return Err(err.into());
                }
            };

            if let Some(dir) = out_dir {
                write_stage_outputs(&finished, &dir)?;
            }
            print_status(&finished, &config.report_base_url);
        }
        Commands::Status { report, json } => {
            let store = config.open_store()?;
            let report = store.get(&report).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report, &config.report_base_url);
            }
        }
    }

    Ok(())
}

fn stage_label(err: &PipelineError) -> String {
    err.stage()
        .map(|stage| stage.to_string())
        .unwrap_or_else(|| "run".to_string())
}
