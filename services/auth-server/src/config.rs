//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret comes from GOOGLE_CLIENT_SECRET or the Google client
//! secrets file, never from the TOML directly.

use common::Secret;
use google_auth::ClientConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// OAuth client registration
#[derive(Debug, Deserialize)]
pub struct GoogleConfig {
    #[serde(default = "default_client_secrets_file")]
    pub client_secrets_file: PathBuf,
    /// Overrides the first redirect URI from the client secrets file
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Empty means the built-in Gmail/Calendar/userinfo set
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(skip)]
    pub client_id: Option<String>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

/// Flow tuning
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

/// Token persistence
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_client_secrets_file() -> PathBuf {
    PathBuf::from(".gauth.json")
}

fn default_timeout() -> u64 {
    30
}

fn default_pending_ttl() -> u64 {
    600
}

fn default_token_dir() -> PathBuf {
    PathBuf::from("tokens")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_secrets_file: default_client_secrets_file(),
            redirect_uri: None,
            scopes: Vec::new(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_dir: default_token_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// A missing file is not an error; every setting has a default or an
    /// environment override.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(path) = env_nonempty("CLIENT_SECRETS_FILE") {
            self.google.client_secrets_file = PathBuf::from(path);
        }
        if let Some(uri) = env_nonempty("REDIRECT_URI") {
            self.google.redirect_uri = Some(uri);
        }
        if let Some(dir) = env_nonempty("TOKEN_STORAGE_DIR") {
            self.storage.token_dir = PathBuf::from(dir);
        }
        if let Some(id) = env_nonempty("GOOGLE_CLIENT_ID") {
            self.google.client_id = Some(id);
        }
        if let Some(secret) = env_nonempty("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = Some(Secret::new(secret));
        }
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.oauth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.oauth.pending_ttl_secs == 0 {
            return Err(common::Error::Config(
                "pending_ttl_secs must be greater than 0".into(),
            ));
        }
        if let Some(uri) = &self.google.redirect_uri {
            if !uri.starts_with("http://") && !uri.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "redirect_uri must start with http:// or https://, got: {uri}"
                )));
            }
        }
        Ok(())
    }

    /// Build the OAuth client registration.
    ///
    /// GOOGLE_CLIENT_ID + GOOGLE_CLIENT_SECRET take precedence over the client
    /// secrets file. Configured redirect URI and scopes override what the file
    /// provides.
    pub fn client_config(&self) -> common::Result<ClientConfig> {
        let mut client = match (&self.google.client_id, &self.google.client_secret) {
            (Some(id), Some(secret)) => ClientConfig::new(
                id.clone(),
                secret.expose().clone(),
                self.google.redirect_uri.clone().unwrap_or_default(),
            ),
            _ => ClientConfig::from_client_secrets_file(&self.google.client_secrets_file)?,
        };

        if let Some(uri) = &self.google.redirect_uri {
            client.redirect_uri = uri.clone();
        }
        if !self.google.scopes.is_empty() {
            client.scopes = self.google.scopes.clone();
        }

        client
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        Ok(client)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("taskiq-auth.toml")
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
