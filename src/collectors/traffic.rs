use crate::collectors::{CollectError, Probe};
use crate::series::TrafficSample;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Reads the cumulative byte counters the kernel exposes under
/// `<sys_class_net>/<iface>/statistics/`. Values are recorded verbatim;
/// rates are left to whoever reads the series.
pub struct TrafficProbe {
    rx_path: PathBuf,
    tx_path: PathBuf,
}

impl TrafficProbe {
    pub fn new(sys_class_net: impl AsRef<Path>, iface: &str) -> Self {
        let statistics = sys_class_net.as_ref().join(iface).join("statistics");
        Self {
            rx_path: statistics.join("rx_bytes"),
            tx_path: statistics.join("tx_bytes"),
        }
    }
}

#[async_trait]
impl Probe for TrafficProbe {
    type Output = TrafficSample;

    async fn sample(&mut self) -> Result<Option<TrafficSample>, CollectError> {
        let Some(rx) = read_counter(&self.rx_path).await? else {
            return Ok(None);
        };
        let Some(tx) = read_counter(&self.tx_path).await? else {
            return Ok(None);
        };
        Ok(Some(TrafficSample(rx, tx)))
    }
}

async fn read_counter(path: &Path) -> Result<Option<String>, CollectError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text.trim().to_string())),
        // interface is down or was removed
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CollectError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{Observation, OutputFormat, SampleSeries};

    fn write_counters(root: &Path, iface: &str, rx: &str, tx: &str) {
        let dir = root.join(iface).join("statistics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rx_bytes"), format!("{rx}\n")).unwrap();
        std::fs::write(dir.join("tx_bytes"), format!("{tx}\n")).unwrap();
    }

    #[tokio::test]
    async fn records_counter_pairs_as_read() {
        let root = tempfile::tempdir().unwrap();
        let mut probe = TrafficProbe::new(root.path(), "crc");
        let mut series = SampleSeries::with_capacity(2);

        write_counters(root.path(), "crc", "100", "50");
        series.push(Observation::Value(probe.sample().await.unwrap().unwrap()));
        write_counters(root.path(), "crc", "150", "80");
        series.push(Observation::Value(probe.sample().await.unwrap().unwrap()));

        let bytes = series.encode(OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, serde_json::json!([["100", "50"], ["150", "80"]]));
    }

    #[tokio::test]
    async fn missing_interface_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let mut probe = TrafficProbe::new(root.path(), "crc");
        assert_eq!(probe.sample().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_counter_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let stats = root.path().join("crc").join("statistics");
        std::fs::create_dir_all(stats.join("rx_bytes")).unwrap();
        let mut probe = TrafficProbe::new(root.path(), "crc");
        assert!(matches!(
            probe.sample().await,
            Err(CollectError::Io { .. })
        ));
    }
}
