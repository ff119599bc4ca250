mod clock;
mod collectors;
mod config;
mod metrics;
mod orchestrator;
mod series;
mod upload;

use clap::Parser;
use clock::{compact_timestamp, now_unix};
use collectors::command::SystemRunner;
use collectors::{Outcome, SamplerReport};
use config::Config;
use metrics::Metrics;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use upload::Uploader;

#[derive(Parser, Debug)]
#[command(name = "monitools")]
#[command(version)]
#[command(about = "Records qemu CPU usage, VM traffic and crictl stats into a data directory")]
struct Cli {
    /// Destination directory [default: data/data_<YYYY-MM-DD>]
    #[arg(short = 'd', long = "dir")]
    dir: Option<String>,
    /// Number of samples per sampler
    #[arg(short = 'n', long)]
    repeats: Option<u32>,
    /// Sleep between samples, in seconds
    #[arg(short = 's', long = "sleep")]
    sleep_secs: Option<u64>,
    /// Optional YAML configuration file
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    log_dir: Option<String>,
    /// Push the data directory to the configured repository afterwards
    #[arg(long)]
    push: bool,
    /// Skip the pause after the final sample
    #[arg(long)]
    no_pace_after_last: bool,
    #[arg(long)]
    print_default_config: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(dir) = &self.dir {
            cfg.data_dir = Some(dir.clone());
        }
        if let Some(repeats) = self.repeats {
            cfg.repeats = repeats;
        }
        if let Some(secs) = self.sleep_secs {
            cfg.interval_secs = secs;
        }
        if let Some(dir) = &self.log_dir {
            cfg.log_dir = dir.clone();
        }
        if self.push {
            cfg.upload.enabled = true;
        }
        if self.no_pace_after_last {
            cfg.sleep_after_last = false;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("monitools: {err}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut cfg);
    if let Err(err) = cfg.validate() {
        eprintln!("monitools: {err}");
        std::process::exit(1);
    }

    let started = SystemTime::now();
    let log_path = match init_tracing(Path::new(&cfg.log_dir), started) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("monitools: could not open a log file in {}: {err}", cfg.log_dir);
            std::process::exit(1);
        }
    };

    let code = run(cfg, started, &log_path).await;
    std::process::exit(code);
}

async fn run(cfg: Config, started: SystemTime, log_path: &Path) -> i32 {
    let data_dir = cfg.data_dir_for(started);
    if let Err(err) = tokio::fs::create_dir_all(&data_dir).await {
        error!(dir = %data_dir.display(), error = %err, "cannot create data directory");
        return 1;
    }

    println!("-------------");
    println!("Running monitoring tools with the following settings:");
    println!("Data directory: {}", data_dir.display());
    println!("Number of repeats: {}", cfg.repeats);
    println!("Pauses between repeats: {}s", cfg.interval_secs);
    println!("Logging into: {}", log_path.display());
    println!("-------------");

    info!(
        data_dir = %data_dir.display(),
        repeats = cfg.repeats,
        interval_secs = cfg.interval_secs,
        sleep_after_last = cfg.sleep_after_last,
        probe_timeout = %cfg.probe_timeout,
        "starting monitools"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("received Ctrl+C, stopping samplers");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!(error = %err, "failed to listen for Ctrl+C"),
        }
    });

    let orchestrator =
        match orchestrator::launch(&cfg, &data_dir, Arc::new(SystemRunner), shutdown_rx) {
            Ok(o) => o,
            Err(err) => {
                error!(error = %err, "failed to start samplers");
                return 1;
            }
        };
    if orchestrator.is_empty() {
        warn!("every sampler is disabled, nothing to collect");
    } else {
        info!(samplers = orchestrator.len(), "samplers launched");
    }

    let mut summary = orchestrator.join_all().await;
    signal_task.abort();

    for report in &summary.reports {
        metrics.record_report(report);
        log_report(report, &cfg);
    }

    if cfg.upload.enabled {
        if summary.has_failures() {
            let failed: Vec<&str> = summary.failures().map(|r| r.sampler).collect();
            warn!(failed = ?failed, "collection had failures, skipping upload");
        } else {
            let pushed = push(&cfg, &data_dir).await;
            match &pushed {
                Ok(files) => {
                    metrics.record_upload(*files, true);
                    info!(files, "data directory pushed");
                }
                Err(err) => {
                    metrics.record_upload(0, false);
                    error!(error = %err, "pushing files failed");
                }
            }
            summary.upload = Some(pushed.map_err(|err| err.to_string()));
        }
    }

    metrics.mark_finished(now_unix());
    if let Some(path) = &cfg.metrics_textfile {
        if let Err(err) = metrics.write_textfile(Path::new(path)).await {
            warn!(path = %path, error = %err, "failed to write metrics textfile");
        }
    }

    summary.exit_code()
}

async fn push(cfg: &Config, data_dir: &Path) -> Result<usize, upload::UploadError> {
    let uploader = Uploader::from_config(&cfg.upload)?;
    uploader.push_dir(data_dir).await
}

fn log_report(report: &SamplerReport, cfg: &Config) {
    let path = report.path.display();
    let elapsed = humantime::format_duration(std::time::Duration::from_millis(
        report.elapsed.as_millis() as u64,
    ));
    if let Some(mean) = report.mean {
        info!(
            sampler = report.sampler,
            mean = %format!("{mean:.2}"),
            "average over recorded values"
        );
    }
    match &report.outcome {
        Outcome::Complete if report.sampler == "remote_stats" => {
            info!(sampler = report.sampler, path = %path, %elapsed, "crictl stats successfully retrieved");
        }
        Outcome::Complete => {
            info!(
                sampler = report.sampler,
                path = %path,
                %elapsed,
                "recorded {} samples at {}s intervals",
                report.samples,
                cfg.interval_secs
            );
        }
        Outcome::Partial if report.is_failure() => {
            error!(
                sampler = report.sampler,
                path = %path,
                failed = report.failed,
                not_found = report.not_found,
                "some probes failed"
            );
        }
        Outcome::Partial => {
            warn!(
                sampler = report.sampler,
                path = %path,
                not_found = report.not_found,
                "target was missing for some samples"
            );
        }
        Outcome::Failed(err) => {
            error!(sampler = report.sampler, path = %path, error = %err, "collection failed");
        }
    }
}

/// Logs go to stderr and to `<log_dir>/monitools_<timestamp>.log`.
fn init_tracing(log_dir: &Path, started: SystemTime) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("monitools_{}.log", compact_timestamp(started)));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();
    Ok(path)
}
