//! review-lease CLI: operator and worker front-end to the review store.

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use review_lease::config::Config;
use review_lease::engine::{
    Decision, Engine, FinalizationReport, PairOutcome, PairPolicy, RecordOutcome, pair_path,
};
use review_lease::model::{LeaseId, MouseButton, NewImage, ResultLabel, ReviewId};
use review_lease::storage::RegisterOutcome;
use review_lease::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::json;

#[derive(Parser)]
#[command(name = "review-lease", about = "Concurrent image review over a shared store")]
struct Cli {
    /// Worker identity stamped on leases and decisions
    #[arg(long, global = true, env = "REVIEW_WORKER")]
    worker: Option<String>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the store schema
    Migrate,
    /// Register one pre-hashed image
    Register {
        path: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        variant: String,
        /// Content digest computed upstream
        #[arg(long)]
        digest: String,
        /// Seed a second, independent QC review
        #[arg(long)]
        qc: bool,
    },
    /// Lease a batch of reviews
    Lease {
        /// Batch size (defaults to REVIEW_BATCH_SIZE)
        #[arg(long)]
        count: Option<usize>,
        /// QC fraction (defaults to REVIEW_QC_RATE)
        #[arg(long)]
        qc_rate: Option<f64>,
    },
    /// Return a lease's unfinished reviews to the pool
    Release { lease: LeaseId },
    /// Record a decision for a leased review
    Decide {
        review: i64,
        lease: LeaseId,
        result: String,
        /// Ruleset version (defaults to REVIEW_STANDARD_VERSION)
        #[arg(long)]
        standard_version: Option<String>,
        /// Also link the `_001` sibling of a `_000` primary
        #[arg(long, value_enum)]
        pair: Option<PairArg>,
    },
    /// Store a click annotation
    Annotate {
        review: i64,
        x: f64,
        y: f64,
        #[arg(long, default_value = "left")]
        button: MouseButton,
    },
    /// Show a device's completed decisions and verdict
    History { device: String },
    /// Print the sibling path of a `_000` primary
    PairPath { path: String },
    /// Close fully-reviewed open devices as unknown
    SweepExhausted,
    /// Review counts per status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum PairArg {
    AutoSkip,
    AssignNow,
}

impl From<PairArg> for PairPolicy {
    fn from(arg: PairArg) -> Self {
        match arg {
            PairArg::AutoSkip => PairPolicy::AutoSkip,
            PairArg::AssignNow => PairPolicy::AssignNow,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Command::PairPath { path } = &cli.command {
        return cmd_pair_path(path, cli.json);
    }

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;

    let mut engine = Engine::open(&config.db_path, config.engine_options())
        .with_context(|| format!("opening store {}", config.db_path.display()))?;

    let json = cli.json;
    match cli.command {
        Command::Migrate => {
            let version = engine.migrate()?;
            emit(json, json!({ "schema_version": version }), || {
                format!("Schema at version {version}")
            })
        }
        Command::Register {
            path,
            device,
            variant,
            digest,
            qc,
        } => {
            let outcome = engine.register_image(NewImage::new(path, device, variant, digest).qc(qc))?;
            emit(json, serde_json::to_value(&outcome)?, || match &outcome {
                RegisterOutcome::Registered { image_id, reviews } => {
                    format!("Registered image {image_id} with {reviews} review(s)")
                }
                RegisterOutcome::AlreadyRegistered { image_id } => {
                    format!("Already registered as image {image_id}")
                }
                RegisterOutcome::Duplicate { existing_path } => {
                    format!("Duplicate content of {existing_path}, nothing stored")
                }
            })
        }
        Command::Lease { count, qc_rate } => {
            let worker = require_worker(cli.worker.as_deref())?;
            cmd_lease(
                &mut engine,
                worker,
                count.unwrap_or(config.batch_size),
                qc_rate.unwrap_or(config.qc_rate),
                json,
            )
        }
        Command::Release { lease } => {
            let worker = require_worker(cli.worker.as_deref())?;
            let outcome = engine.release_lease(worker, lease)?;
            emit(json, serde_json::to_value(outcome)?, || {
                format!("Released {} review(s) from lease {}", outcome.released, lease.short())
            })
        }
        Command::Decide {
            review,
            lease,
            result,
            standard_version,
            pair,
        } => {
            let worker = require_worker(cli.worker.as_deref())?;
            let version = standard_version.unwrap_or_else(|| config.standard_version.clone());
            cmd_decide(
                &mut engine,
                worker,
                ReviewId(review),
                lease,
                &ResultLabel::new(result),
                &version,
                pair.map(PairPolicy::from),
                json,
            )
        }
        Command::Annotate {
            review,
            x,
            y,
            button,
        } => {
            let id = engine.add_annotation(ReviewId(review), x, y, button)?;
            emit(json, json!({ "annotation_id": id }), || {
                format!("Annotation {id} stored on review {review}")
            })
        }
        Command::History { device } => {
            let history = engine.device_history(&device)?;
            let verdict = engine.device(&device)?;
            let value = json!({ "device": verdict, "history": history });
            emit(json, value, || {
                let mut out = format!(
                    "Device {device}: {}",
                    verdict
                        .final_result
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "open".to_string())
                );
                for (variant, result) in &history {
                    out.push_str(&format!("\n  {variant:<6} {result}"));
                }
                out
            })
        }
        Command::PairPath { .. } => Ok(()),
        Command::SweepExhausted => {
            let closed = engine.finalize_exhausted_devices()?;
            emit(json, json!({ "closed": closed }), || {
                format!("{} device(s) closed as unknown", closed.len())
            })
        }
        Command::Status => {
            let counts = engine.storage().status_counts()?;
            let value = counts
                .iter()
                .map(|(status, n)| (status.to_string(), json!(n)))
                .collect::<serde_json::Map<_, _>>();
            emit(json, value.into(), || {
                counts
                    .iter()
                    .map(|(status, n)| format!("{status:<12} {n}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn cmd_lease(
    engine: &mut Engine,
    worker: &str,
    count: usize,
    qc_rate: f64,
    json: bool,
) -> anyhow::Result<()> {
    let lease = engine.lease_batch(worker, count, qc_rate)?;
    let exhausted = if lease.is_empty() && count > 0 {
        engine.finalize_exhausted_devices()?
    } else {
        Vec::new()
    };

    emit(
        json,
        json!({ "lease": lease, "exhausted_devices": exhausted }),
        || {
            if lease.is_empty() {
                return format!(
                    "No reviews available. {} device(s) closed as unknown",
                    exhausted.len()
                );
            }
            let mut out = format!(
                "Lease {} ({} item(s), {} QC)\n",
                lease.id,
                lease.items.len(),
                lease.qc_drawn
            );
            out.push_str(&format!(
                "{:<8}  {:<8}  {:<16}  {:<3}  PATH",
                "REVIEW", "IMAGE", "DEVICE", "QC"
            ));
            for item in &lease.items {
                out.push_str(&format!(
                    "\n{:<8}  {:<8}  {:<16}  {:<3}  {}",
                    item.review_id,
                    item.image_id,
                    item.device_id,
                    if item.qc_flag { "yes" } else { "-" },
                    item.path
                ));
            }
            out
        },
    )
}

#[allow(clippy::too_many_arguments)]
fn cmd_decide(
    engine: &mut Engine,
    worker: &str,
    review_id: ReviewId,
    lease: LeaseId,
    result: &ResultLabel,
    version: &str,
    pair: Option<PairPolicy>,
    json: bool,
) -> anyhow::Result<()> {
    let decision = engine.record_decision(review_id, worker, lease, result, version)?;

    // Pair linkage follows the primary's own decision only.
    let pair_outcome = match (pair, decision.is_recorded()) {
        (Some(policy), true) => {
            let primary = engine.review(review_id)?;
            let image = engine.storage().get_image(primary.image_id)?;
            Some(engine.link_pair(policy, &image.path, worker, lease, version)?)
        }
        _ => None,
    };

    emit(json, decision_json(&decision, pair_outcome.as_ref()), || {
        let mut out = match decision.outcome {
            RecordOutcome::Recorded => format!("Recorded {result} for review {review_id}"),
            RecordOutcome::Stale => {
                format!("Review {review_id} is no longer leased to {worker} under this lease")
            }
        };
        match &decision.finalization {
            FinalizationReport::Fired(f) => out.push_str(&format!(
                "\nDevice {} closed ({:?}), {} review(s) auto-closed",
                f.device_id, f.rule, f.closed_reviews
            )),
            FinalizationReport::Failed(e) => {
                out.push_str(&format!("\nDevice finalization failed: {e}"))
            }
            FinalizationReport::NotEvaluated | FinalizationReport::NoRuleFired => {}
        }
        match &pair_outcome {
            Some(PairOutcome::Skipped(id)) => out.push_str(&format!("\nSibling review {id} skipped")),
            Some(PairOutcome::Assigned(item)) => {
                out.push_str(&format!("\nSibling review {} leased: {}", item.review_id, item.path))
            }
            Some(PairOutcome::Busy(id)) => {
                out.push_str(&format!("\nSibling review {id} is held elsewhere"))
            }
            Some(PairOutcome::NoPair) | None => {}
        }
        out
    })
}

fn decision_json(decision: &Decision, pair: Option<&PairOutcome>) -> serde_json::Value {
    let outcome = match decision.outcome {
        RecordOutcome::Recorded => "recorded",
        RecordOutcome::Stale => "stale",
    };
    let finalization = match &decision.finalization {
        FinalizationReport::NotEvaluated => json!({ "status": "not_evaluated" }),
        FinalizationReport::NoRuleFired => json!({ "status": "no_rule_fired" }),
        FinalizationReport::Fired(f) => json!({ "status": "fired", "finalization": f }),
        FinalizationReport::Failed(e) => json!({ "status": "failed", "error": e.to_string() }),
    };
    json!({ "outcome": outcome, "finalization": finalization, "pair": pair })
}

fn cmd_pair_path(path: &str, json: bool) -> anyhow::Result<()> {
    let sibling = pair_path(path);
    emit(json, json!({ "path": path, "pair": sibling }), || {
        sibling.clone().unwrap_or_else(|| "-".to_string())
    })
}

fn require_worker(worker: Option<&str>) -> anyhow::Result<&str> {
    worker
        .filter(|w| !w.trim().is_empty())
        .context("a worker identity is required (--worker or REVIEW_WORKER)")
}

fn emit(json: bool, value: serde_json::Value, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}
