//! Operator entry point for the offender indexer.
//!
//! Every command prints its result as JSON on stdout. Exit codes: 0 on success, 9 when the
//! index status does not allow the operation (the status is printed), 4 when an offender does
//! not exist upstream, 1 for anything else.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indexer_service::config::IndexerConfig;
use indexer_service::listeners::{drain, spawn_housekeeping, spawn_listeners};
use indexer_service::queues::Channel;
use indexer_service::source::InMemorySource;
use indexer_service::telemetry::TracingTelemetry;
use indexer_service::{CancelToken, Indexer, ServiceError};
use offender_model::{ChangeEvent, EventEnvelope, OFFENDER_CHANGED};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "offender-indexer")]
#[command(about = "Blue/green search index builder for offender records")]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Upstream offender records, one JSON document per line
    #[arg(short, long, value_name = "PATH")]
    offenders: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the index status
    Status,
    /// Show status, index sizes, alias and queue depths
    Info,
    /// Start rebuilding the other index
    BuildIndex,
    /// Finish the build in progress and promote it
    MarkComplete {
        /// Complete even when the built index is short of the upstream total
        #[arg(long)]
        ignore_threshold: bool,
    },
    /// Swap the current and other index
    SwitchIndex {
        /// Cancel a build in progress and keep a complete index live
        #[arg(long)]
        force: bool,
    },
    /// Cancel the build in progress
    CancelIndex,
    /// Re-sync one offender into the live index
    IndexOffender { crn: String },
    PurgeIndexQueue,
    PurgeIndexDlq,
    PurgeEventDlq,
    /// Move build DLQ messages back to the build queue
    TransferIndexDlq,
    /// Move event DLQ messages back to the event queue
    TransferEventDlq,
    /// Run one housekeeping pass
    QueueHousekeeping,
    /// Put a change event for an offender on the event queue
    PublishEvent {
        crn: String,
        #[arg(long, default_value = OFFENDER_CHANGED)]
        event_type: String,
    },
    /// Process queued messages in this process until both queues are idle
    Drain {
        /// Upper bound on messages handled per queue
        #[arg(long, default_value_t = 100_000)]
        max: usize,
    },
    /// Run the queue listeners and housekeeping until stdin closes or the time runs out
    Run {
        #[arg(long, value_name = "SECS")]
        for_secs: Option<u64>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_tracing(args.verbose);

    match run(args) {
        Ok(out) => {
            println!("{}", pretty(&out));
            ExitCode::SUCCESS
        }
        Err(err) => report(&err),
    }
}

fn run(args: Args) -> Result<serde_json::Value, ServiceError> {
    let cfg = match &args.config {
        Some(path) => IndexerConfig::load(path)?,
        None => IndexerConfig::default(),
    };
    let source = match &args.offenders {
        Some(path) => InMemorySource::load_json_lines(path)?,
        None => InMemorySource::new(),
    };
    let indexer = Indexer::open(&cfg, Arc::new(source), Arc::new(TracingTelemetry))?;
    let svc = indexer.service();
    let admin = indexer.admin();

    let out = match args.command {
        Command::Status => to_json(&svc.index_status()?),
        Command::Info => to_json(&svc.index_info()?),
        Command::BuildIndex => to_json(&svc.prepare_index_for_rebuild()?),
        Command::MarkComplete { ignore_threshold } => to_json(&svc.mark_indexing_complete(ignore_threshold)?),
        Command::SwitchIndex { force } => to_json(&svc.switch_index(force)?),
        Command::CancelIndex => to_json(&svc.cancel_indexing()?),
        Command::IndexOffender { crn } => to_json(&svc.update_offender(&crn)?),
        Command::PurgeIndexQueue => json!({ "purged": admin.purge_build_queue()? }),
        Command::PurgeIndexDlq => json!({ "purged": admin.purge_build_dlq()? }),
        Command::PurgeEventDlq => json!({ "purged": admin.purge_event_dlq()? }),
        Command::TransferIndexDlq => json!({ "transferred": admin.redrive_dlq(Channel::Build)? }),
        Command::TransferEventDlq => json!({ "transferred": admin.redrive_dlq(Channel::Event)? }),
        Command::QueueHousekeeping => to_json(&admin.run_housekeeping()),
        Command::PublishEvent { crn, event_type } => {
            let envelope = EventEnvelope::new(&event_type, &ChangeEvent { crn: crn.clone() })
                .map_err(|e| ServiceError::Codec(e.to_string()))?;
            let body = serde_json::to_string(&envelope).map_err(|e| ServiceError::Codec(e.to_string()))?;
            indexer.queues().send_raw(Channel::Event, &body)?;
            json!({ "published": crn, "eventType": event_type })
        }
        Command::Drain { max } => {
            let mut build = 0;
            let mut events = 0;
            loop {
                let b = drain(&indexer.build_listener(), indexer.queues(), max - build)?;
                let e = drain(&indexer.event_listener(), indexer.queues(), max - events)?;
                build += b;
                events += e;
                if (b == 0 && e == 0) || build >= max || events >= max {
                    break;
                }
            }
            json!({ "build": build, "events": events })
        }
        Command::Run { for_secs } => {
            run_workers(&indexer, &cfg, for_secs)?;
            to_json(&svc.index_info()?)
        }
    };
    Ok(out)
}

fn run_workers(indexer: &Indexer, cfg: &IndexerConfig, for_secs: Option<u64>) -> Result<(), ServiceError> {
    let cancel = CancelToken::new();
    let spawn_err = |e: std::io::Error| ServiceError::Internal(format!("spawn worker: {e}"));
    let mut workers = spawn_listeners(
        indexer.service().clone(),
        indexer.queues().clone(),
        cfg.workers.poll_interval(),
        cancel.clone(),
    )
    .map_err(spawn_err)?;
    workers.push(
        spawn_housekeeping(indexer.admin().clone(), cfg.workers.housekeeping_interval(), cancel.clone())
            .map_err(spawn_err)?,
    );

    match for_secs {
        Some(secs) => {
            info!(secs, "workers running");
            std::thread::sleep(Duration::from_secs(secs));
        }
        None => {
            info!("workers running; close stdin to stop");
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    for w in workers {
        if w.join().is_err() {
            return Err(ServiceError::Internal("worker thread panicked".into()));
        }
    }
    info!("workers stopped");
    Ok(())
}

fn report(err: &ServiceError) -> ExitCode {
    match err {
        ServiceError::Conflict(conflict) => {
            println!(
                "{}",
                pretty(&json!({ "error": conflict.kind(), "message": conflict.to_string(), "status": conflict.status() }))
            );
            ExitCode::from(9)
        }
        ServiceError::OffenderNotFound(crn) => {
            println!("{}", pretty(&json!({ "error": "OffenderNotFound", "crn": crn })));
            ExitCode::from(4)
        }
        other => {
            eprintln!("Error: {other}");
            ExitCode::from(1)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("indexer_service=debug,index_store=debug,info")
        } else {
            EnvFilter::new("warn,telemetry=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
