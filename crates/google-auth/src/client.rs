//! OAuth client registration: id, secret, endpoints, redirect URI and scopes
//!
//! Google hands out a "client secrets" JSON file when an OAuth client is
//! registered. It nests the fields under `web` or `installed` depending on the
//! application type; both are accepted here.

use std::path::Path;

use common::Secret;
use serde::Deserialize;
use tracing::info;

use crate::constants::{AUTHORIZE_ENDPOINT, DEFAULT_SCOPES, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Registered OAuth client as seen by the authorization and token endpoints.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub auth_uri: String,
    pub token_uri: String,
    /// Fixed, provider-registered callback URL
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    web: Option<ClientSecretsEntry>,
    installed: Option<ClientSecretsEntry>,
}

#[derive(Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: Option<Secret<String>>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl ClientConfig {
    /// Client with Google's default endpoints and scopes.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Some(Secret::new(client_secret.into())),
            auth_uri: AUTHORIZE_ENDPOINT.to_string(),
            token_uri: TOKEN_ENDPOINT.to_string(),
            redirect_uri: redirect_uri.into(),
            scopes: default_scopes(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_endpoints(mut self, auth_uri: impl Into<String>, token_uri: impl Into<String>) -> Self {
        self.auth_uri = auth_uri.into();
        self.token_uri = token_uri.into();
        self
    }

    /// Load a Google client secrets JSON file.
    ///
    /// The redirect URI defaults to the first registered one; callers usually
    /// override it from configuration.
    pub fn from_client_secrets_file(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!(
                "failed to read client secrets file {}: {e}",
                path.display()
            ))
        })?;
        let config = Self::from_client_secrets_json(&contents)?;
        info!(path = %path.display(), client_id = %config.client_id, "loaded client secrets");
        Ok(config)
    }

    /// Parse the contents of a Google client secrets file.
    pub fn from_client_secrets_json(contents: &str) -> common::Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(contents)?;
        let entry = file.web.or(file.installed).ok_or_else(|| {
            common::Error::Config(
                "client secrets file must contain a \"web\" or \"installed\" section".into(),
            )
        })?;

        Ok(Self {
            client_id: entry.client_id,
            client_secret: entry.client_secret,
            auth_uri: entry.auth_uri.unwrap_or_else(|| AUTHORIZE_ENDPOINT.to_string()),
            token_uri: entry.token_uri.unwrap_or_else(|| TOKEN_ENDPOINT.to_string()),
            redirect_uri: entry.redirect_uris.into_iter().next().unwrap_or_default(),
            scopes: default_scopes(),
        })
    }

    /// Check that everything needed to talk to the provider is present.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Configuration("client_id is not configured".into()));
        }
        match &self.client_secret {
            Some(secret) if !secret.is_blank() => {}
            _ => {
                return Err(Error::Configuration(
                    "client_secret is not configured".into(),
                ));
            }
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(Error::Configuration(
                "redirect_uri is not configured".into(),
            ));
        }
        for (name, value) in [
            ("auth_uri", &self.auth_uri),
            ("token_uri", &self.token_uri),
            ("redirect_uri", &self.redirect_uri),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| Error::Configuration(format!("{name} is not a valid URL: {e}")))?;
            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(Error::Configuration(format!(
                    "{name} must use http or https, got: {value}"
                )));
            }
        }
        Ok(())
    }

    /// Client secret as a plain string slice, empty when absent.
    pub(crate) fn secret_str(&self) -> &str {
        self.client_secret
            .as_ref()
            .map(|s| s.expose().as_str())
            .unwrap_or_default()
    }
}

/// Scopes requested when configuration does not list any.
pub fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}
