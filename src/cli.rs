use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use clipchain::config::Config;
use clipchain::init;
use clipchain::job_spec::JobSpec;
use clipchain::{CancelFlag, JobOutcome, Pipeline};

const USAGE: &str = "usage: clipchain <jobs.json> [--config <config.json>]";

struct Args {
    jobs: PathBuf,
    config: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut jobs = None;
    let mut config = PathBuf::from("config.json");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = args.next().map(PathBuf::from).context(USAGE)?;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ if jobs.is_none() => jobs = Some(PathBuf::from(arg)),
            _ => anyhow::bail!("unexpected argument {arg}\n{USAGE}"),
        }
    }
    Ok(Args {
        jobs: jobs.context(USAGE)?,
        config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let config = Config::load(&args.config).await?;
    init::ensure_directories(&config.jobs_dir).await?;

    if !init::check_ffmpeg(&config.ffmpeg_bin, &config.ffprobe_bin) {
        eprintln!("[WARNING] FFmpeg not found in PATH. Stitching will fail.");
    }

    let specs = JobSpec::load(&args.jobs).await?;
    let pipeline = Arc::new(Pipeline::from_config(config)?);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[WARNING] Cancelling after the current stage...");
                cancel.cancel();
            }
        });
    }

    let reports = pipeline.run_batch(specs, cancel).await;

    let mut failed = 0;
    for report in &reports {
        match &report.outcome {
            JobOutcome::Succeeded => println!(
                "{}: succeeded -> {}",
                report.job_id,
                report.output_path().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            JobOutcome::SucceededWithSkips { skipped } => println!(
                "{}: succeeded, skipped segments {:?} -> {}",
                report.job_id,
                skipped,
                report.output_path().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            JobOutcome::Failed { stage, reason } => {
                failed += 1;
                println!("{}: failed at {}: {}", report.job_id, stage, reason);
            }
        }
    }

    std::process::exit(if failed == 0 { 0 } else { 1 });
}
