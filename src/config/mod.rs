// src/config/mod.rs
mod models;

pub use models::*;

use std::path::Path;
use tokio::io::AsyncReadExt;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server URL {line:?}: {source}")]
    InvalidUrl {
        line: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

    let config: ProxyConfig = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        _ => serde_json::from_str(&contents)?,
    };

    Ok(config)
}

/// Read a newline-separated list from a file, or from standard input when
/// `source` is `None` or `-`.
pub async fn read_source(source: Option<&str>) -> Result<String, ConfigError> {
    match source {
        None | Some("-") => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .map_err(|source| ConfigError::Io {
                    path: "<stdin>".to_string(),
                    source,
                })?;
            Ok(buf)
        }
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            }),
    }
}

fn lines(data: &str) -> impl Iterator<Item = &str> {
    data.lines().map(str::trim).filter(|line| !line.is_empty())
}

pub fn parse_server_list(data: &str) -> Result<Vec<Url>, ConfigError> {
    lines(data)
        .map(|line| {
            Url::parse(line).map_err(|source| ConfigError::InvalidUrl {
                line: line.to_string(),
                source,
            })
        })
        .collect()
}

pub fn parse_token_list(data: &str) -> Vec<String> {
    lines(data).map(str::to_string).collect()
}
