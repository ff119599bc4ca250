pub mod command;
pub mod cpu;
pub mod remote;
pub mod traffic;

use crate::series::{Observation, OutputFormat, SampleSeries, SeriesValue};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {}: {stderr}", exit_code_text(.code))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected probe output: {0}")]
    Parse(String),
    #[error("{what} timed out after {}", format_after(.after))]
    Timeout { what: String, after: Duration },
    #[error("i/o on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

fn format_after(after: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*after)
}

impl CollectError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        CollectError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Source of one observation per call.
#[async_trait]
pub trait Probe: Send {
    type Output: SeriesValue;

    /// `Ok(None)` means the target does not exist right now.
    async fn sample(&mut self) -> Result<Option<Self::Output>, CollectError>;
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub repeats: u32,
    pub interval: Duration,
    /// Keep the pause after the final sample as well.
    pub sleep_after_last: bool,
    pub probe_timeout: Duration,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete,
    Partial,
    Failed(String),
}

/// What a sampler hands back to the orchestrator, exactly once per run.
#[derive(Debug, Clone)]
pub struct SamplerReport {
    pub sampler: &'static str,
    pub path: PathBuf,
    pub samples: usize,
    pub not_found: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Mean of the recorded values, for numeric series.
    pub mean: Option<f64>,
    pub outcome: Outcome,
}

impl SamplerReport {
    pub fn failed(sampler: &'static str, path: PathBuf, error: impl ToString) -> Self {
        Self {
            sampler,
            path,
            samples: 0,
            not_found: 0,
            failed: 0,
            elapsed: Duration::ZERO,
            mean: None,
            outcome: Outcome::Failed(error.to_string()),
        }
    }

    /// An absent target is not a failure; a failed probe is.
    pub fn is_failure(&self) -> bool {
        match self.outcome {
            Outcome::Complete => false,
            Outcome::Partial => self.failed > 0,
            Outcome::Failed(_) => true,
        }
    }
}

pub async fn run_sampler<P: Probe>(
    sampler: &'static str,
    mut probe: P,
    path: PathBuf,
    settings: SamplerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> SamplerReport {
    let started = Instant::now();
    let mut series: SampleSeries<P::Output> =
        SampleSeries::with_capacity(settings.repeats as usize);
    let mut cancelled = false;

    for index in 0..settings.repeats {
        let observation = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                cancelled = true;
                break;
            }
            observation = observe(&mut probe, settings.probe_timeout) => observation,
        };
        debug!(index, ?observation, "sample taken");
        series.push(observation);

        let last = index + 1 == settings.repeats;
        if last && !settings.sleep_after_last {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                cancelled = true;
                break;
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }

    // a shutdown during the trailing pause loses nothing
    if cancelled && series.len() == settings.repeats as usize {
        debug!("shutdown after the final sample");
        cancelled = false;
    }

    let tally = series.tally();
    let mean = series.mean();
    let written = write_series(&series, &path, settings.format).await;
    let outcome = match (written, cancelled) {
        (Err(err), _) => {
            warn!(path = %path.display(), error = %err, "failed to persist series");
            Outcome::Failed(err.to_string())
        }
        (Ok(()), true) => {
            warn!(samples = series.len(), "collection cancelled, partial series kept");
            Outcome::Failed(CollectError::Cancelled.to_string())
        }
        (Ok(()), false) if tally.not_found == 0 && tally.failed == 0 => Outcome::Complete,
        (Ok(()), false) => Outcome::Partial,
    };

    info!(
        path = %path.display(),
        samples = series.len(),
        not_found = tally.not_found,
        failed = tally.failed,
        mean = ?mean,
        "sampler finished"
    );

    SamplerReport {
        sampler,
        path,
        samples: series.len(),
        not_found: tally.not_found,
        failed: tally.failed,
        elapsed: started.elapsed(),
        mean,
        outcome,
    }
}

async fn observe<P: Probe>(probe: &mut P, timeout: Duration) -> Observation<P::Output> {
    match tokio::time::timeout(timeout, probe.sample()).await {
        Ok(Ok(Some(value))) => Observation::Value(value),
        Ok(Ok(None)) => Observation::NotFound,
        Ok(Err(err)) => {
            warn!(error = %err, "probe failed");
            Observation::Failed {
                error: err.to_string(),
            }
        }
        Err(_elapsed) => {
            let err = CollectError::Timeout {
                what: "probe".to_string(),
                after: timeout,
            };
            warn!(error = %err, "probe timeout");
            Observation::Failed {
                error: err.to_string(),
            }
        }
    }
}

async fn write_series<T: SeriesValue>(
    series: &SampleSeries<T>,
    path: &Path,
    format: OutputFormat,
) -> Result<(), CollectError> {
    let bytes = series.encode(format)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| CollectError::io(path, source))
}

/// Resolves once shutdown is signalled; never, if the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
