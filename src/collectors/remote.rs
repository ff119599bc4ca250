use crate::clock::compact_timestamp;
use crate::collectors::command::CommandRunner;
use crate::collectors::{shutdown_requested, CollectError, Outcome, SamplerReport};
use crate::config::RemoteStatsConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

/// One-shot `crictl stats` dump fetched from the VM over ssh.
pub struct RemoteStatsCollector {
    runner: Arc<dyn CommandRunner>,
    ssh_program: String,
    destination: String,
    identity_file: PathBuf,
    connect_timeout_secs: u64,
    command: Vec<String>,
    extension: String,
}

impl RemoteStatsCollector {
    pub fn new(runner: Arc<dyn CommandRunner>, cfg: &RemoteStatsConfig) -> Self {
        Self {
            runner,
            ssh_program: cfg.ssh_program.clone(),
            destination: format!("{}@{}", cfg.user, cfg.host),
            identity_file: expand_home(&cfg.identity_file),
            connect_timeout_secs: cfg.connect_timeout_secs,
            command: cfg.command.clone(),
            extension: cfg.extension.clone(),
        }
    }

    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.identity_file.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            self.destination.clone(),
        ];
        args.extend(self.command.iter().cloned());
        args
    }

    pub fn output_path(&self, dir: &Path, at: SystemTime) -> PathBuf {
        dir.join(format!(
            "crictl-stats-{}.{}",
            compact_timestamp(at),
            self.extension
        ))
    }

    /// Writes the remote stdout to a timestamped file, also when the
    /// command fails.
    pub async fn collect(
        &self,
        dir: &Path,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> SamplerReport {
        let started = Instant::now();
        let path = self.output_path(dir, SystemTime::now());
        let args = self.ssh_args();

        let result = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => Err(CollectError::Cancelled),
            run = tokio::time::timeout(timeout, self.runner.run(&self.ssh_program, &args)) => {
                run.unwrap_or_else(|_| {
                    Err(CollectError::Timeout {
                        what: format!("{} {}", self.ssh_program, self.destination),
                        after: timeout,
                    })
                })
            }
        };

        let (stdout, failure) = match result {
            Ok(output) if output.success() => (output.stdout, None),
            Ok(mut output) => {
                let stdout = std::mem::take(&mut output.stdout);
                (stdout, Some(output.into_failure(&self.ssh_program)))
            }
            Err(err) => (Vec::new(), Some(err)),
        };

        let written = tokio::fs::write(&path, &stdout)
            .await
            .map_err(|source| CollectError::io(&path, source));

        let outcome = match (failure, written) {
            (_, Err(err)) => {
                warn!(path = %path.display(), error = %err, "failed to write remote stats");
                Outcome::Failed(err.to_string())
            }
            (Some(err), Ok(())) => {
                warn!(host = %self.destination, error = %err, "remote stats command failed");
                Outcome::Failed(err.to_string())
            }
            (None, Ok(())) => {
                info!(path = %path.display(), bytes = stdout.len(), "remote stats saved");
                Outcome::Complete
            }
        };

        SamplerReport {
            sampler: "remote_stats",
            samples: usize::from(outcome == Outcome::Complete),
            path,
            not_found: 0,
            failed: 0,
            elapsed: started.elapsed(),
            mean: None,
            outcome,
        }
    }
}

/// `~/...` to `$HOME/...`; ssh would not expand it when passed as an argument.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
