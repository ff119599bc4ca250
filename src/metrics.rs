use crate::collectors::SamplerReport;
use prometheus::core::Collector;
use prometheus::{opts, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub observations_total: CounterVec,
    pub sampler_success: GaugeVec,
    pub sampler_duration_seconds: GaugeVec,
    pub sampler_mean: GaugeVec,
    pub upload_files_total: Gauge,
    pub upload_success: Gauge,
    pub last_run_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let observations_total = CounterVec::new(
            opts!(
                "monitools_observations_total",
                "Observations recorded per sampler by kind (value, not_found, failed)"
            ),
            &["sampler", "kind"],
        )?;
        let sampler_success = GaugeVec::new(
            opts!(
                "monitools_sampler_success",
                "1 if the sampler's last run succeeded, 0 otherwise"
            ),
            &["sampler"],
        )?;
        let sampler_duration_seconds = GaugeVec::new(
            opts!(
                "monitools_sampler_duration_seconds",
                "Wall time of the sampler's last run"
            ),
            &["sampler"],
        )?;
        let sampler_mean = GaugeVec::new(
            opts!(
                "monitools_sampler_mean",
                "Mean of the values recorded by numeric samplers (cpu percent)"
            ),
            &["sampler"],
        )?;
        let upload_files_total = Gauge::with_opts(opts!(
            "monitools_upload_files_total",
            "Files pushed to the data repository in the last run"
        ))?;
        let upload_success = Gauge::with_opts(opts!(
            "monitools_upload_success",
            "1 if the last upload succeeded, 0 otherwise"
        ))?;
        let last_run_timestamp_seconds = Gauge::with_opts(opts!(
            "monitools_last_run_timestamp_seconds",
            "Unix time the last run finished"
        ))?;

        register(&registry, &observations_total)?;
        register(&registry, &sampler_success)?;
        register(&registry, &sampler_duration_seconds)?;
        register(&registry, &sampler_mean)?;
        register(&registry, &upload_files_total)?;
        register(&registry, &upload_success)?;
        register(&registry, &last_run_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            observations_total,
            sampler_success,
            sampler_duration_seconds,
            sampler_mean,
            upload_files_total,
            upload_success,
            last_run_timestamp_seconds,
        }))
    }

    pub fn record_report(&self, report: &SamplerReport) {
        let values = report
            .samples
            .saturating_sub(report.not_found + report.failed);
        for (kind, count) in [
            ("value", values),
            ("not_found", report.not_found),
            ("failed", report.failed),
        ] {
            self.observations_total
                .with_label_values(&[report.sampler, kind])
                .inc_by(count as f64);
        }
        self.sampler_success
            .with_label_values(&[report.sampler])
            .set(if report.is_failure() { 0.0 } else { 1.0 });
        self.sampler_duration_seconds
            .with_label_values(&[report.sampler])
            .set(report.elapsed.as_secs_f64());
        if let Some(mean) = report.mean {
            self.sampler_mean
                .with_label_values(&[report.sampler])
                .set(mean);
        }
    }

    pub fn record_upload(&self, files: usize, ok: bool) {
        self.upload_files_total.set(files as f64);
        self.upload_success.set(if ok { 1.0 } else { 0.0 });
    }

    pub fn mark_finished(&self, now_unix: i64) {
        self.last_run_timestamp_seconds.set(now_unix as f64);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }

    /// Writes the text exposition format for a node_exporter textfile
    /// collector, replacing the previous file by rename.
    pub async fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        let buf = self
            .encode_metrics()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        let tmp = path.with_extension("prom.tmp");
        tokio::fs::write(&tmp, buf).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Outcome;
    use std::path::PathBuf;
    use std::time::Duration;

    fn report(outcome: Outcome, samples: usize, not_found: usize, failed: usize) -> SamplerReport {
        SamplerReport {
            sampler: "cpu",
            path: PathBuf::from("cpu.json"),
            samples,
            not_found,
            failed,
            elapsed: Duration::from_millis(1500),
            mean: Some(12.5),
            outcome,
        }
    }

    #[test]
    fn report_counts_land_in_the_registry() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.record_report(&report(Outcome::Partial, 5, 2, 1));
        metrics.mark_finished(1_700_000_000);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains(r#"monitools_observations_total{kind="value",sampler="cpu"} 2"#));
        assert!(text.contains(r#"monitools_observations_total{kind="not_found",sampler="cpu"} 2"#));
        assert!(text.contains(r#"monitools_sampler_success{sampler="cpu"} 0"#));
        assert!(text.contains(r#"monitools_sampler_duration_seconds{sampler="cpu"} 1.5"#));
        assert!(text.contains("monitools_last_run_timestamp_seconds 1700000000"));
        assert!(text.contains(r#"monitools_sampler_mean{sampler="cpu"} 12.5"#));
    }

    #[tokio::test]
    async fn textfile_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitools.prom");
        let metrics = Metrics::new().expect("metrics init");
        metrics.record_report(&report(Outcome::Complete, 3, 0, 0));
        metrics.record_upload(3, true);

        metrics.write_textfile(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("monitools_upload_files_total 3"));
        assert!(!dir.path().join("monitools.prom.tmp").exists());
    }
}
