use crate::series::OutputFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Defaults to `data/data_YYYY-MM-DD`.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sleep_after_last")]
    pub sleep_after_last: bool,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub metrics_textfile: Option<String>,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub remote_stats: RemoteStatsConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuSource {
    #[default]
    Top,
    Sysinfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CpuConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default)]
    pub source: CpuSource,
    #[serde(default)]
    pub format: OutputFormat,
    /// Relative to the data directory. Defaults to `cpu.json` / `cpu.csv`.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_sys_class_net")]
    pub sys_class_net: String,
    #[serde(default)]
    pub format: OutputFormat,
    /// Relative to the data directory. Defaults to `traffic.json` / `traffic.csv`.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteStatsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_user")]
    pub user: String,
    #[serde(default = "default_identity_file")]
    pub identity_file: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_remote_command")]
    pub command: Vec<String>,
    #[serde(default = "default_remote_extension")]
    pub extension: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,
    /// File holding the API token; takes precedence over `token_file_env`.
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default = "default_token_file_env")]
    pub token_file_env: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub committer_name: Option<String>,
    #[serde(default)]
    pub committer_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            repeats: default_repeats(),
            interval_secs: default_interval_secs(),
            sleep_after_last: default_sleep_after_last(),
            probe_timeout: default_probe_timeout(),
            log_dir: default_log_dir(),
            metrics_textfile: None,
            cpu: CpuConfig::default(),
            traffic: TrafficConfig::default(),
            remote_stats: RemoteStatsConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            process_name: default_process_name(),
            source: CpuSource::default(),
            format: OutputFormat::default(),
            output: None,
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interface: default_interface(),
            sys_class_net: default_sys_class_net(),
            format: OutputFormat::default(),
            output: None,
        }
    }
}

impl Default for RemoteStatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ssh_program: default_ssh_program(),
            host: default_remote_host(),
            user: default_remote_user(),
            identity_file: default_identity_file(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command: default_remote_command(),
            extension: default_remote_extension(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_api_url(),
            owner: default_owner(),
            repo: default_repo(),
            branch: default_branch(),
            remote_prefix: default_remote_prefix(),
            token_file: None,
            token_file_env: default_token_file_env(),
            commit_message: default_commit_message(),
            committer_name: None,
            committer_email: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_timeout_duration()?.is_zero() {
            return Err(ConfigError::Validation(
                "probe_timeout must be greater than zero".to_string(),
            ));
        }
        if self.log_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "log_dir must not be empty".to_string(),
            ));
        }
        if let Some(dir) = &self.data_dir {
            if dir.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "data_dir must not be empty when set".to_string(),
                ));
            }
        }

        validate_cpu(&self.cpu)?;
        validate_traffic(&self.traffic)?;
        validate_remote_stats(&self.remote_stats)?;
        validate_upload(&self.upload)?;

        Ok(())
    }

    pub fn probe_timeout_duration(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.probe_timeout).map_err(|err| {
            ConfigError::Validation(format!(
                "probe_timeout '{}' is not a duration: {err}",
                self.probe_timeout
            ))
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn data_dir_for(&self, started: SystemTime) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new("data").join(format!(
                "data_{}",
                crate::clock::date_stamp(started)
            )),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl CpuConfig {
    pub fn output_name(&self) -> String {
        output_name("cpu", self.output.as_deref(), self.format)
    }
}

impl TrafficConfig {
    pub fn output_name(&self) -> String {
        output_name("traffic", self.output.as_deref(), self.format)
    }
}

fn output_name(stem: &str, output: Option<&str>, format: OutputFormat) -> String {
    match (output, format) {
        (Some(name), _) => name.to_string(),
        (None, OutputFormat::Json) => format!("{stem}.json"),
        (None, OutputFormat::Csv) => format!("{stem}.csv"),
    }
}

fn validate_output_name(
    section: &str,
    name: &str,
    format: OutputFormat,
) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{section}.output must not be empty"
        )));
    }
    if Path::new(name).is_absolute() || name.split(['/', '\\']).any(|part| part == "..") {
        return Err(ConfigError::Validation(format!(
            "{section}.output '{name}' must stay inside the data directory"
        )));
    }
    let declared = match Path::new(name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Some(OutputFormat::Json),
        Some(ext) if ext.eq_ignore_ascii_case("csv") => Some(OutputFormat::Csv),
        _ => None,
    };
    if declared.is_some_and(|declared| declared != format) {
        return Err(ConfigError::Validation(format!(
            "{section}.output '{name}' does not match {section}.format {format:?}"
        )));
    }
    Ok(())
}

fn validate_cpu(cfg: &CpuConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.process_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "cpu.process_name must not be empty".to_string(),
        ));
    }
    validate_output_name("cpu", &cfg.output_name(), cfg.format)
}

fn validate_traffic(cfg: &TrafficConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.interface.trim().is_empty() || cfg.interface.contains('/') {
        return Err(ConfigError::Validation(format!(
            "traffic.interface '{}' is not an interface name",
            cfg.interface
        )));
    }
    if cfg.sys_class_net.trim().is_empty() {
        return Err(ConfigError::Validation(
            "traffic.sys_class_net must not be empty".to_string(),
        ));
    }
    validate_output_name("traffic", &cfg.output_name(), cfg.format)
}

fn validate_remote_stats(cfg: &RemoteStatsConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.host.trim().is_empty() || cfg.user.trim().is_empty() {
        return Err(ConfigError::Validation(
            "remote_stats.host and remote_stats.user are required".to_string(),
        ));
    }
    if cfg.command.is_empty() {
        return Err(ConfigError::Validation(
            "remote_stats.command must not be empty".to_string(),
        ));
    }
    if cfg.connect_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "remote_stats.connect_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.extension.is_empty() || !cfg.extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::Validation(format!(
            "remote_stats.extension '{}' must be alphanumeric",
            cfg.extension
        )));
    }
    Ok(())
}

fn validate_upload(cfg: &UploadConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if !(cfg.api_url.starts_with("http://") || cfg.api_url.starts_with("https://")) {
        return Err(ConfigError::Validation(
            "upload.api_url must be an http(s) URL".to_string(),
        ));
    }
    for (field, value) in [
        ("owner", &cfg.owner),
        ("repo", &cfg.repo),
        ("branch", &cfg.branch),
        ("commit_message", &cfg.commit_message),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "upload.{field} must not be empty"
            )));
        }
    }
    if cfg.committer_name.is_some() != cfg.committer_email.is_some() {
        return Err(ConfigError::Validation(
            "upload.committer_name and upload.committer_email go together".to_string(),
        ));
    }
    Ok(())
}

const fn default_repeats() -> u32 {
    5
}

const fn default_interval_secs() -> u64 {
    1
}

const fn default_sleep_after_last() -> bool {
    true
}

fn default_probe_timeout() -> String {
    "30s".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

const fn default_enabled() -> bool {
    true
}

fn default_process_name() -> String {
    "qemu".to_string()
}

fn default_interface() -> String {
    "crc".to_string()
}

fn default_sys_class_net() -> String {
    "/sys/class/net".to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_remote_host() -> String {
    "192.168.130.11".to_string()
}

fn default_remote_user() -> String {
    "core".to_string()
}

fn default_identity_file() -> String {
    "~/.crc/machines/crc/id_ecdsa".to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_remote_command() -> Vec<String> {
    ["sudo", "crictl", "stats", "-o", "yaml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_remote_extension() -> String {
    "yaml".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_owner() -> String {
    "code-ready".to_string()
}

fn default_repo() -> String {
    "crc-data".to_string()
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_remote_prefix() -> String {
    "data".to_string()
}

fn default_token_file_env() -> String {
    "GITHUB_TOKEN_LOCATION".to_string()
}

fn default_commit_message() -> String {
    "New data".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn defaults_are_valid() {
        Config::default()
            .validate()
            .expect("built-in defaults must validate");
    }

    #[test]
    fn example_file_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert_eq!(cfg.repeats, 5);
        assert_eq!(cfg.cpu.process_name, "qemu");
        assert_eq!(cfg.remote_stats.extension, "yaml");
    }

    #[test]
    fn empty_document_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.interval_secs, 1);
        assert!(cfg.sleep_after_last);
        assert_eq!(cfg.traffic.interface, "crc");
        assert!(!cfg.upload.enabled);
    }

    #[test]
    fn probe_timeout_uses_humantime() {
        let mut cfg = Config::default();
        cfg.probe_timeout = "1m 30s".to_string();
        assert_eq!(cfg.probe_timeout_duration().unwrap(), Duration::from_secs(90));

        cfg.probe_timeout = "soon".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        cfg.probe_timeout = "0s".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cpu_output_name_follows_format() {
        let mut cpu = CpuConfig::default();
        assert_eq!(cpu.output_name(), "cpu.json");
        cpu.format = OutputFormat::Csv;
        assert_eq!(cpu.output_name(), "cpu.csv");
        cpu.output = Some("qemu.csv".to_string());
        assert_eq!(cpu.output_name(), "qemu.csv");
    }

    #[test]
    fn traffic_output_name_follows_format() {
        let mut traffic = TrafficConfig::default();
        assert_eq!(traffic.output_name(), "traffic.json");
        traffic.format = OutputFormat::Csv;
        assert_eq!(traffic.output_name(), "traffic.csv");
    }

    #[test]
    fn output_extension_must_agree_with_format() {
        let mut cfg = Config::default();
        cfg.traffic.output = Some("traffic.csv".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("traffic.format"));

        cfg.traffic.format = OutputFormat::Csv;
        cfg.validate().expect("csv name with csv format");

        cfg.cpu.output = Some("qemu.dat".to_string());
        cfg.validate().expect("unknown extensions are left alone");
    }

    #[test]
    fn outputs_must_stay_in_data_dir() {
        let mut cfg = Config::default();
        cfg.traffic.output = Some("../traffic.json".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.cpu.output = Some("/tmp/cpu.json".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_sections_are_not_validated() {
        let mut cfg = Config::default();
        cfg.traffic.enabled = false;
        cfg.traffic.interface = String::new();
        cfg.remote_stats.enabled = false;
        cfg.remote_stats.command.clear();
        cfg.validate().expect("disabled sections are ignored");
    }

    #[test]
    fn upload_requires_matching_committer_fields() {
        let mut cfg = Config::default();
        cfg.upload.enabled = true;
        cfg.upload.committer_name = Some("Data Bot".to_string());
        assert!(cfg.validate().is_err());
        cfg.upload.committer_email = Some("bot@example.com".to_string());
        cfg.validate().expect("complete committer validates");
    }

    #[test]
    fn default_data_dir_is_dated() {
        let cfg = Config::default();
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            cfg.data_dir_for(at),
            PathBuf::from("data").join("data_2023-11-14")
        );
    }

    #[test]
    fn unreadable_file_is_reported_with_path() {
        let err = Config::load_from_file("/nonexistent/monitools.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/monitools.yaml"));
    }
}
