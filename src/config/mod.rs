//! Configuration file and credential loading.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "iot";
pub const DEFAULT_API_URL: &str = "https://api.iot.bader.solutions";

/// CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the platform API; the terminal WebSocket lives on the same host
    pub api_url: String,
    /// Drop terminal frames whose payload does not match the header digest
    pub verify_payload_digest: bool,
    /// Timeout for single HTTP requests
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            verify_payload_digest: false,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// `<config dir>/iot`
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME))
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Load an explicit file, else the default file if present, else defaults.
    /// Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("IOT_API_URL").filter(|u| !u.is_empty()) {
            self.api_url = url;
        }
        if let Some(flag) = var("IOT_VERIFY_PAYLOAD_DIGEST") {
            self.verify_payload_digest = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Access token and tenant written by `iot auth login`
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub tenant_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl Credentials {
    /// Environment variables win over `credentials.json` in the config dir
    pub fn resolve() -> Result<Self> {
        let token = std::env::var("IOT_ACCESS_TOKEN").ok();
        let tenant = std::env::var("IOT_TENANT_ID").ok();
        if let (Some(access_token), Some(tenant_id)) = (token, tenant) {
            return Ok(Self {
                access_token,
                tenant_id,
            });
        }

        let dir = Config::dir().ok_or_else(|| anyhow!("could not determine config directory"))?;
        Self::load(&dir.join("credentials.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| {
            format!(
                "authentication required: no credentials at {}, please run 'iot auth login'",
                path.display()
            )
        })?;
        let credentials: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if credentials.access_token.is_empty() {
            return Err(anyhow!("authentication required: please run 'iot auth login'"));
        }
        if credentials.tenant_id.is_empty() {
            return Err(anyhow!("tenant ID not found: please run 'iot auth login'"));
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "verify_payload_digest = true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.verify_payload_digest);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IOT_API_URL", "http://localhost:8080"),
            ("IOT_VERIFY_PAYLOAD_DIGEST", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_url, "http://localhost:8080");
        assert!(config.verify_payload_digest);
    }

    #[test]
    fn test_load_credentials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, r#"{"access_token":"abc","tenant_id":"t-1"}"#).unwrap();

        let creds = Credentials::load(&path).unwrap();
        assert_eq!(creds.access_token, "abc");
        assert_eq!(creds.tenant_id, "t-1");
        assert!(!format!("{creds:?}").contains("abc"));
    }

    #[test]
    fn test_empty_token_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, r#"{"access_token":"","tenant_id":"t-1"}"#).unwrap();
        assert!(Credentials::load(&path).is_err());
    }
}
