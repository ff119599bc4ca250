use crate::collectors::command::CommandRunner;
use crate::collectors::cpu::{CpuProbe, SysinfoCpuProbe, TopCpuProbe};
use crate::collectors::remote::RemoteStatsCollector;
use crate::collectors::traffic::TrafficProbe;
use crate::collectors::{run_sampler, SamplerReport, SamplerSettings};
use crate::config::{Config, ConfigError, CpuSource};
use crate::series::OutputFormat;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<SamplerReport>,
    /// Files pushed, or why the push failed. `None` when no upload ran.
    pub upload: Option<Result<usize, String>>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(SamplerReport::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SamplerReport> {
        self.reports.iter().filter(|r| r.is_failure())
    }

    /// `1` if a sampler or the upload failed, `0` otherwise.
    pub fn exit_code(&self) -> i32 {
        let upload_failed = matches!(self.upload, Some(Err(_)));
        i32::from(self.has_failures() || upload_failed)
    }
}

/// Samplers running as independent tasks. Every task is joined; a failing
/// sampler never cuts a sibling short.
#[derive(Default)]
pub struct Orchestrator {
    tasks: Vec<(&'static str, PathBuf, JoinHandle<SamplerReport>)>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs `job` in its own task, inside a span naming the sampler.
    pub fn spawn<F>(&mut self, sampler: &'static str, path: PathBuf, job: F)
    where
        F: Future<Output = SamplerReport> + Send + 'static,
    {
        let span = info_span!("sampler", name = sampler);
        let handle = tokio::spawn(job.instrument(span));
        self.tasks.push((sampler, path, handle));
    }

    pub async fn join_all(self) -> RunSummary {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for (sampler, path, handle) in self.tasks {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    error!(sampler, error = %err, "sampler task aborted");
                    SamplerReport::failed(sampler, path, format!("task aborted: {err}"))
                }
            };
            reports.push(report);
        }
        RunSummary {
            reports,
            upload: None,
        }
    }
}

/// Spawns every enabled sampler writing into `data_dir`.
pub fn launch(
    cfg: &Config,
    data_dir: &Path,
    runner: Arc<dyn CommandRunner>,
    shutdown: watch::Receiver<bool>,
) -> Result<Orchestrator, ConfigError> {
    let probe_timeout = cfg.probe_timeout_duration()?;
    let settings = |format: OutputFormat| SamplerSettings {
        repeats: cfg.repeats,
        interval: cfg.interval(),
        sleep_after_last: cfg.sleep_after_last,
        probe_timeout,
        format,
    };
    let mut orchestrator = Orchestrator::new();

    if cfg.traffic.enabled {
        let path = data_dir.join(cfg.traffic.output_name());
        let probe = TrafficProbe::new(&cfg.traffic.sys_class_net, &cfg.traffic.interface);
        info!(iface = %cfg.traffic.interface, path = %path.display(), "recording traffic in/out of the VM");
        orchestrator.spawn(
            "traffic",
            path.clone(),
            run_sampler("traffic", probe, path, settings(cfg.traffic.format), shutdown.clone()),
        );
    }

    if cfg.cpu.enabled {
        let path = data_dir.join(cfg.cpu.output_name());
        let probe = match cfg.cpu.source {
            CpuSource::Top => CpuProbe::Top(TopCpuProbe::new(runner.clone(), &cfg.cpu.process_name)),
            CpuSource::Sysinfo => CpuProbe::Sysinfo(SysinfoCpuProbe::new(&cfg.cpu.process_name)),
        };
        info!(
            process = %cfg.cpu.process_name,
            source = ?cfg.cpu.source,
            path = %path.display(),
            "recording CPU usage"
        );
        orchestrator.spawn(
            "cpu",
            path.clone(),
            run_sampler("cpu", probe, path, settings(cfg.cpu.format), shutdown.clone()),
        );
    }

    if cfg.remote_stats.enabled {
        let collector = RemoteStatsCollector::new(runner, &cfg.remote_stats);
        let dir = data_dir.to_path_buf();
        info!(host = %cfg.remote_stats.host, "retrieving crictl stats from the VM");
        let shutdown = shutdown.clone();
        orchestrator.spawn("remote_stats", dir.clone(), async move {
            collector.collect(&dir, probe_timeout, shutdown).await
        });
    }

    Ok(orchestrator)
}
