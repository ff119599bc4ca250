use crate::collectors::command::CommandRunner;
use crate::collectors::{CollectError, Probe};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tracing::debug;

/// CPU usage of the oldest process matching a name, in percent of one core.
pub enum CpuProbe {
    Top(TopCpuProbe),
    Sysinfo(SysinfoCpuProbe),
}

#[async_trait]
impl Probe for CpuProbe {
    type Output = f64;

    async fn sample(&mut self) -> Result<Option<f64>, CollectError> {
        match self {
            CpuProbe::Top(probe) => probe.sample().await,
            CpuProbe::Sysinfo(probe) => probe.sample().await,
        }
    }
}

/// `pgrep` for the PID, then a one-shot `top` scoped to it.
pub struct TopCpuProbe {
    runner: Arc<dyn CommandRunner>,
    process_name: String,
}

impl TopCpuProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, process_name: impl Into<String>) -> Self {
        Self {
            runner,
            process_name: process_name.into(),
        }
    }

    async fn find_pid(&self) -> Result<Option<u32>, CollectError> {
        let out = self
            .runner
            .run("pgrep", &["-o".to_string(), self.process_name.clone()])
            .await?;
        match out.code {
            Some(0) => {}
            // pgrep: no process matched
            Some(1) => return Ok(None),
            _ => return Err(out.into_failure("pgrep")),
        }

        let text = out.stdout_text();
        let first = text.lines().next().unwrap_or("").trim();
        first
            .parse::<u32>()
            .map(Some)
            .map_err(|_| CollectError::Parse(format!("pgrep printed '{first}' instead of a pid")))
    }
}

#[async_trait]
impl Probe for TopCpuProbe {
    type Output = f64;

    async fn sample(&mut self) -> Result<Option<f64>, CollectError> {
        let Some(pid) = self.find_pid().await? else {
            debug!(process = %self.process_name, "process not running");
            return Ok(None);
        };

        let args = ["-b", "-n", "1", "-p"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(pid.to_string()))
            .collect::<Vec<_>>();
        let out = self.runner.run("top", &args).await?;
        if !out.success() {
            return Err(out.into_failure("top"));
        }

        parse_top_cpu(&out.stdout_text(), pid)
    }
}

/// Reads the `%CPU` column of the row for `pid` from `top -b` output.
/// `Ok(None)` if the row is missing, which happens when the process exits
/// between `pgrep` and `top`.
pub fn parse_top_cpu(output: &str, pid: u32) -> Result<Option<f64>, CollectError> {
    let pid_text = pid.to_string();
    let mut cpu_column = None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = fields.first() else {
            continue;
        };

        match cpu_column {
            None => {
                if *first == "PID" {
                    cpu_column = Some(fields.iter().position(|f| *f == "%CPU").ok_or_else(
                        || CollectError::Parse("top header has no %CPU column".to_string()),
                    )?);
                }
            }
            Some(column) => {
                if *first != pid_text {
                    continue;
                }
                let raw = fields.get(column).ok_or_else(|| {
                    CollectError::Parse(format!("top row for pid {pid} is too short"))
                })?;
                return parse_percent(raw).map(Some);
            }
        }
    }

    if cpu_column.is_none() {
        return Err(CollectError::Parse(
            "top output has no process table header".to_string(),
        ));
    }
    Ok(None)
}

fn parse_percent(raw: &str) -> Result<f64, CollectError> {
    // some locales print a decimal comma
    raw.replace(',', ".")
        .parse::<f64>()
        .map_err(|_| CollectError::Parse(format!("'{raw}' is not a cpu percentage")))
}

/// Reads process CPU usage through `sysinfo` instead of scraping `top`.
///
/// Usage is computed between two refreshes, so the probe keeps one
/// `System` alive for the whole series. Refreshes run on the blocking
/// pool; one cut off by the probe timeout loses its `System`.
pub struct SysinfoCpuProbe {
    system: Option<System>,
    process_name: String,
}

impl SysinfoCpuProbe {
    pub fn new(process_name: impl Into<String>) -> Self {
        let mut system = System::new();
        system.refresh_processes();
        Self {
            system: Some(system),
            process_name: process_name.into(),
        }
    }
}

fn oldest_match(system: &System, process_name: &str) -> Option<Pid> {
    system
        .processes_by_name(process_name)
        .min_by_key(|p| (p.start_time(), p.pid().as_u32()))
        .map(|p| p.pid())
}

#[async_trait]
impl Probe for SysinfoCpuProbe {
    type Output = f64;

    async fn sample(&mut self) -> Result<Option<f64>, CollectError> {
        // a refresh cut off by the timeout keeps its table; start over
        let mut system = self.system.take().unwrap_or_else(|| {
            debug!("previous refresh did not finish, rebuilding the process table");
            System::new()
        });
        let name = self.process_name.clone();

        let (system, usage) = tokio::task::spawn_blocking(move || {
            system.refresh_processes();
            let usage = oldest_match(&system, &name)
                .and_then(|pid| system.process(pid))
                .map(|p| p.cpu_usage() as f64);
            (system, usage)
        })
        .await
        .map_err(|err| {
            CollectError::io(
                Path::new("/proc"),
                std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
            )
        })?;
        self.system = Some(system);

        if usage.is_none() {
            debug!(process = %self.process_name, "process not running");
        }
        Ok(usage)
    }
}
