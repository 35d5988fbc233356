//! Typed startup configuration: a YAML file (§6) layered with a handful of
//! CLI flags. Loaded once, read-only for the lifetime of the process.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

fn default_http_port() -> u16 {
    9876
}

fn default_backend_ssh_port() -> u16 {
    22
}

fn default_backend_username() -> String {
    "gitlab-workspaces".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_protocol() -> String {
    "https".to_string()
}

/// `auth:` block — the OAuth2 client registration and session signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub host: String,
    pub signing_key: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// `http:` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_http_port(),
        }
    }
}

/// `ssh:` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub host_key: String,
    #[serde(default = "default_backend_ssh_port")]
    pub backend_port: u16,
    #[serde(default = "default_backend_username")]
    pub backend_username: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 0,
            host_key: String::new(),
            backend_port: default_backend_ssh_port(),
            backend_username: default_backend_username(),
        }
    }
}

/// Top-level configuration schema, deserialized directly from the YAML
/// file named by `--config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config is invalid: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate a config from a YAML file at `path`. A missing,
    /// unreadable, or malformed file is a fatal error, surfaced directly
    /// rather than swallowed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.client_id.is_empty() {
            return Err(ConfigError::Invalid("auth.client_id is required".into()));
        }
        if self.auth.client_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.client_secret is required".into(),
            ));
        }
        if self.auth.host.is_empty() {
            return Err(ConfigError::Invalid("auth.host is required".into()));
        }
        if self.auth.redirect_uri.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.redirect_uri is required".into(),
            ));
        }
        if self.auth.signing_key.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.signing_key is required".into(),
            ));
        }
        if !self.http.enabled && !self.ssh.enabled {
            return Err(ConfigError::Invalid(
                "at least one of http.enabled or ssh.enabled must be true".into(),
            ));
        }
        if self.ssh.enabled && self.ssh.host_key.is_empty() {
            return Err(ConfigError::Invalid(
                "ssh.host_key is required when ssh.enabled is true".into(),
            ));
        }
        Ok(())
    }
}

/// Command-line flags. Everything else comes from the YAML config file.
#[derive(Debug, Parser, Clone)]
#[command(name = "workspace-gate-proxy")]
#[command(about = "Authenticating reverse proxy for ephemeral workspace pods")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Path to a kubeconfig file; defaults to the in-cluster config when unset.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const VALID: &str = r#"
auth:
  client_id: "client-id"
  client_secret: "client-secret"
  redirect_uri: "https://workspaces.example.com/auth/callback"
  host: "https://gitlab.example.com"
  signing_key: "super-secret-key"
http:
  enabled: true
  port: 9000
ssh:
  enabled: false
"#;

    #[test]
    fn loads_valid_config_with_overridden_port() {
        let file = write_fixture(VALID);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.auth.client_id, "client-id");
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.auth.protocol, "https");
    }

    #[test]
    fn missing_client_secret_is_fatal() {
        let fixture = r#"
auth:
  client_id: "client-id"
  client_secret: ""
  redirect_uri: "https://workspaces.example.com/auth/callback"
  host: "https://gitlab.example.com"
  signing_key: "super-secret-key"
http:
  enabled: true
"#;
        let file = write_fixture(fixture);
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn both_listeners_disabled_is_fatal() {
        let fixture = r#"
auth:
  client_id: "c"
  client_secret: "s"
  redirect_uri: "https://h/auth/callback"
  host: "https://h"
  signing_key: "k"
"#;
        let file = write_fixture(fixture);
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_fatal_read_error() {
        let err = Config::load("/nonexistent/path/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn ssh_enabled_without_host_key_is_fatal() {
        let fixture = r#"
auth:
  client_id: "c"
  client_secret: "s"
  redirect_uri: "https://h/auth/callback"
  host: "https://h"
  signing_key: "k"
ssh:
  enabled: true
  port: 2222
"#;
        let file = write_fixture(fixture);
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
