use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::{record_store::DEFAULT_AUTH_COLLECTION, upload::UploadPolicy};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to read config: {0}")]
    Read(std::io::Error),
    #[error("Failed to parse YAML config: {0}")]
    ParseYaml(serde_yaml::Error),
    #[error("Failed to parse TOML config: {0}")]
    ParseToml(toml::de::Error),
    #[error("Base url cannot hold a path: {0}")]
    InvalidBaseUrl(Url),
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Auth collection used for password login.
    pub collection: String,
    /// Pre-issued token, used when no login is requested.
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_AUTH_COLLECTION.to_owned(),
            token: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Root of the record store, e.g. `http://127.0.0.1:8090`.
    pub base_url: Url,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upload: UploadPolicy,
}

impl Config {
    /// Parse `src` as TOML when `path` ends in `.toml`, as YAML otherwise.
    pub fn parse(path: &Path, src: &str) -> Result<Self, Error> {
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(src).map_err(Error::ParseToml)?,
            _ => serde_yaml::from_str(src).map_err(Error::ParseYaml)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let src = tokio::fs::read_to_string(path).await.map_err(Error::Read)?;
        Self::parse(path, &src)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.base_url.cannot_be_a_base() {
            return Err(Error::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }
}
