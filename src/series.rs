use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One probe invocation.
///
/// On disk a value is written bare, an absent target as `null` and a
/// failed probe as `{"error": "..."}`, so a series of plain readings stays
/// a plain JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Observation<T> {
    Value(T),
    Failed { error: String },
    NotFound,
}

impl<T> Observation<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Observation::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Cumulative RX/TX byte counters of one interface, kept as the raw
/// counter text. Serialized as `["rx", "tx"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample(pub String, pub String);

/// Values a sampler can record and persist.
pub trait SeriesValue: Serialize + DeserializeOwned + std::fmt::Debug + Send + 'static {
    /// Number of CSV fields one observation occupies.
    const CSV_WIDTH: usize;

    fn csv_fields(&self) -> Vec<String>;

    /// Numeric reading, for values that can be averaged.
    fn as_number(&self) -> Option<f64> {
        None
    }
}

impl SeriesValue for f64 {
    const CSV_WIDTH: usize = 1;

    fn csv_fields(&self) -> Vec<String> {
        vec![self.to_string()]
    }

    fn as_number(&self) -> Option<f64> {
        Some(*self)
    }
}

impl SeriesValue for TrafficSample {
    const CSV_WIDTH: usize = 2;

    fn csv_fields(&self) -> Vec<String> {
        vec![self.0.clone(), self.1.clone()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub values: usize,
    pub not_found: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleSeries<T> {
    observations: Vec<Observation<T>>,
}

impl<T> Default for SampleSeries<T> {
    fn default() -> Self {
        Self {
            observations: Vec::new(),
        }
    }
}

impl<T> SampleSeries<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observations: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, observation: Observation<T>) {
        self.observations.push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation<T>] {
        &self.observations
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for observation in &self.observations {
            match observation {
                Observation::Value(_) => tally.values += 1,
                Observation::NotFound => tally.not_found += 1,
                Observation::Failed { .. } => tally.failed += 1,
            }
        }
        tally
    }
}

impl<T: SeriesValue> SampleSeries<T> {
    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>, serde_json::Error> {
        match format {
            OutputFormat::Json => serde_json::to_vec_pretty(self),
            OutputFormat::Csv => Ok(self.to_csv_row().into_bytes()),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Average over the recorded values; gaps are skipped. `None` when no
    /// value is numeric.
    pub fn mean(&self) -> Option<f64> {
        let (sum, count) = self
            .observations
            .iter()
            .filter_map(|o| o.value().and_then(T::as_number))
            .fold((0.0, 0_usize), |(sum, count), v| (sum + v, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Single CSV row; absent or failed observations leave their fields empty.
    fn to_csv_row(&self) -> String {
        let mut fields = Vec::with_capacity(self.observations.len() * T::CSV_WIDTH);
        for observation in &self.observations {
            match observation {
                Observation::Value(v) => fields.extend(v.csv_fields().into_iter().map(csv_escape)),
                _ => fields.extend(std::iter::repeat(String::new()).take(T::CSV_WIDTH)),
            }
        }
        let mut row = fields.join(",");
        row.push('\n');
        row
    }
}

fn csv_escape(field: String) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traffic(rx: &str, tx: &str) -> Observation<TrafficSample> {
        Observation::Value(TrafficSample(rx.to_string(), tx.to_string()))
    }

    #[test]
    fn traffic_series_is_an_array_of_string_pairs() {
        let mut series = SampleSeries::with_capacity(2);
        series.push(traffic("100", "50"));
        series.push(traffic("150", "80"));

        let bytes = series.encode(OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, serde_json::json!([["100", "50"], ["150", "80"]]));
    }

    #[test]
    fn mixed_cpu_series_survives_json() {
        let mut series = SampleSeries::default();
        series.push(Observation::Value(12.5));
        series.push(Observation::NotFound);
        series.push(Observation::Failed {
            error: "top exited with 1".to_string(),
        });
        series.push(Observation::Value(3.0));

        let bytes = series.encode(OutputFormat::Json).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("null"));
        assert!(text.contains("\"error\": \"top exited with 1\""));

        let back: SampleSeries<f64> = SampleSeries::from_json(&bytes).unwrap();
        assert_eq!(back, series);
    }

    #[test]
    fn csv_row_leaves_gaps_for_missing_samples() {
        let mut series = SampleSeries::default();
        series.push(Observation::Value(1.5));
        series.push(Observation::NotFound);
        series.push(Observation::Value(2.0));
        let bytes = series.encode(OutputFormat::Csv).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "1.5,,2\n");

        let mut pairs = SampleSeries::default();
        pairs.push(traffic("1", "2"));
        pairs.push(Observation::Failed {
            error: "gone".to_string(),
        });
        let bytes = pairs.encode(OutputFormat::Csv).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "1,2,,\n");
    }

    #[test]
    fn tally_counts_each_kind() {
        let mut series: SampleSeries<f64> = SampleSeries::default();
        series.push(Observation::Value(1.0));
        series.push(Observation::NotFound);
        series.push(Observation::NotFound);
        series.push(Observation::Failed {
            error: "x".to_string(),
        });
        assert_eq!(
            series.tally(),
            Tally {
                values: 1,
                not_found: 2,
                failed: 1
            }
        );
        assert_eq!(series.len(), 4);
    }

    #[test]
    fn mean_skips_gaps_and_ignores_non_numeric_series() {
        let mut series = SampleSeries::default();
        series.push(Observation::Value(30.0));
        series.push(Observation::NotFound);
        series.push(Observation::Value(10.0));
        series.push(Observation::Failed {
            error: "x".to_string(),
        });
        assert_eq!(series.mean(), Some(20.0));

        let empty: SampleSeries<f64> = SampleSeries::default();
        assert_eq!(empty.mean(), None);

        let mut pairs = SampleSeries::default();
        pairs.push(traffic("100", "50"));
        assert_eq!(pairs.mean(), None);
    }

    #[test]
    fn empty_series_encodes_as_empty_array() {
        let series: SampleSeries<f64> = SampleSeries::default();
        assert!(series.is_empty());
        let bytes = series.encode(OutputFormat::Json).unwrap();
        assert_eq!(bytes, b"[]");
    }
}
