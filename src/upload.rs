//! Pushes a finished data directory to a GitHub repository, one commit
//! per file, through the REST contents API.

use crate::config::UploadConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no API token: set upload.token_file or the {0} environment variable")]
    MissingToken(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("token file {0} is empty")]
    EmptyToken(String),
    #[error("request for {path} failed: {source}")]
    Http {
        path: String,
        source: reqwest::Error,
    },
    #[error("GitHub rejected {path} with status {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Serialize)]
struct Committer<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    committer: Option<Committer<'a>>,
}

pub struct Uploader {
    client: Client,
    cfg: UploadConfig,
    token: String,
}

impl Uploader {
    pub fn from_config(cfg: &UploadConfig) -> Result<Self, UploadError> {
        let token = resolve_token(cfg)?;
        let client = Client::builder()
            .user_agent(concat!("monitools/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self {
            client,
            cfg: cfg.clone(),
            token,
        })
    }

    /// Uploads every file under `dir`; stops at the first failure.
    pub async fn push_dir(&self, dir: &Path) -> Result<usize, UploadError> {
        let files = collect_files(dir)?;
        info!(
            dir = %dir.display(),
            files = files.len(),
            repo = %format!("{}/{}", self.cfg.owner, self.cfg.repo),
            "uploading data directory"
        );
        for file in &files {
            let remote = remote_path(&self.cfg.remote_prefix, dir, file);
            self.push_file(file, &remote).await?;
        }
        Ok(files.len())
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), UploadError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| UploadError::Read {
                path: local.display().to_string(),
                source,
            })?;
        let body = request_body(&self.cfg, &bytes);
        let url = contents_url(&self.cfg.api_url, &self.cfg.owner, &self.cfg.repo, remote);

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|source| UploadError::Http {
                path: remote.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                path: remote.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        debug!(path = %remote, bytes = bytes.len(), "file pushed");
        Ok(())
    }
}

fn resolve_token(cfg: &UploadConfig) -> Result<String, UploadError> {
    let location = match &cfg.token_file {
        Some(path) if !path.trim().is_empty() => path.clone(),
        _ => std::env::var(&cfg.token_file_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| UploadError::MissingToken(cfg.token_file_env.clone()))?,
    };

    let token = std::fs::read_to_string(&location).map_err(|source| UploadError::Read {
        path: location.clone(),
        source,
    })?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(UploadError::EmptyToken(location));
    }
    Ok(token)
}

fn request_body<'a>(cfg: &'a UploadConfig, content: &[u8]) -> PutContents<'a> {
    let committer = match (&cfg.committer_name, &cfg.committer_email) {
        (Some(name), Some(email)) => Some(Committer { name, email }),
        _ => None,
    };
    PutContents {
        message: &cfg.commit_message,
        content: STANDARD.encode(content),
        branch: &cfg.branch,
        committer,
    }
}

pub fn contents_url(api_url: &str, owner: &str, repo: &str, path: &str) -> String {
    format!(
        "{}/repos/{owner}/{repo}/contents/{path}",
        api_url.trim_end_matches('/')
    )
}

/// `<prefix>/<dir name>/<path relative to dir>`, always with `/`.
pub fn remote_path(prefix: &str, dir: &Path, file: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    if let Some(name) = dir.file_name() {
        parts.push(name.to_string_lossy().into_owned());
    }
    let relative = file.strip_prefix(dir).unwrap_or(file);
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

/// Regular files below `dir`, sorted by path.
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, UploadError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|source| UploadError::Read {
            path: current.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| UploadError::Read {
                path: current.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| UploadError::Read {
                path: path.display().to_string(),
                source,
            })?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_keeps_the_dated_directory() {
        let dir = Path::new("data/data_2024-01-31");
        assert_eq!(
            remote_path("data", dir, &dir.join("cpu.json")),
            "data/data_2024-01-31/cpu.json"
        );
        assert_eq!(
            remote_path("/archive/", dir, &dir.join("nested").join("x.yaml")),
            "archive/data_2024-01-31/nested/x.yaml"
        );
        assert_eq!(
            remote_path("", dir, &dir.join("traffic.json")),
            "data_2024-01-31/traffic.json"
        );
    }

    #[test]
    fn contents_url_tolerates_trailing_slash() {
        assert_eq!(
            contents_url("https://api.github.com/", "code-ready", "crc-data", "data/a.json"),
            "https://api.github.com/repos/code-ready/crc-data/contents/data/a.json"
        );
    }

    #[test]
    fn body_is_base64_with_optional_committer() {
        let mut cfg = UploadConfig::default();
        let body = serde_json::to_value(request_body(&cfg, b"[1.5]")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "message": "New data",
                "content": "WzEuNV0=",
                "branch": "master",
            })
        );

        cfg.committer_name = Some("Data Bot".to_string());
        cfg.committer_email = Some("bot@example.com".to_string());
        let body = serde_json::to_value(request_body(&cfg, b"")).unwrap();
        assert_eq!(body["committer"]["email"], "bot@example.com");
    }

    #[test]
    fn collects_nested_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("traffic.json"), "[]").unwrap();
        std::fs::write(dir.path().join("cpu.json"), "[]").unwrap();
        std::fs::create_dir(dir.path().join("extra")).unwrap();
        std::fs::write(dir.path().join("extra").join("a.yaml"), "").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["cpu.json", "extra/a.yaml", "traffic.json"]);
    }

    #[test]
    fn token_is_read_from_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "ghp_secret\n").unwrap();

        let cfg = UploadConfig {
            token_file: Some(token_path.display().to_string()),
            ..UploadConfig::default()
        };
        assert_eq!(resolve_token(&cfg).unwrap(), "ghp_secret");

        std::fs::write(&token_path, "  \n").unwrap();
        assert!(matches!(
            resolve_token(&cfg),
            Err(UploadError::EmptyToken(_))
        ));
    }

    #[test]
    fn missing_token_location_is_reported() {
        let cfg = UploadConfig {
            token_file_env: "MONITOOLS_TEST_MISSING_TOKEN_ENV".to_string(),
            ..UploadConfig::default()
        };
        std::env::remove_var("MONITOOLS_TEST_MISSING_TOKEN_ENV");
        assert!(matches!(
            resolve_token(&cfg),
            Err(UploadError::MissingToken(_))
        ));
    }
}
