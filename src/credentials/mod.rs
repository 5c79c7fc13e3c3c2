//! Registry credentials and the retriever chain
//!
//! Only the contract "produce a credential for a registry host" lives here;
//! helper-process discovery belongs to the callers. Retrievers run in
//! order and the first one that yields a credential wins.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{BuildError, Result};
use crate::image::reference::DOCKER_HUB_REGISTRY;

/// A credential for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// Pre-issued bearer token, sent as-is.
    Token(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Produces a credential for a registry host, or nothing.
#[async_trait]
pub trait CredentialRetriever: Send + Sync {
    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>>;

    /// Short name used in authentication failure diagnostics.
    fn description(&self) -> String;
}

/// Always returns the same credential.
pub struct StaticCredentialRetriever {
    credential: Credential,
}

impl StaticCredentialRetriever {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialRetriever for StaticCredentialRetriever {
    async fn retrieve(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(Some(self.credential.clone()))
    }

    fn description(&self) -> String {
        "static credential".to_string()
    }
}

/// Reads a username/password pair from two environment variables.
pub struct EnvironmentCredentialRetriever {
    username_variable: String,
    password_variable: String,
}

impl EnvironmentCredentialRetriever {
    pub fn new(username_variable: impl Into<String>, password_variable: impl Into<String>) -> Self {
        Self {
            username_variable: username_variable.into(),
            password_variable: password_variable.into(),
        }
    }
}

#[async_trait]
impl CredentialRetriever for EnvironmentCredentialRetriever {
    async fn retrieve(&self, _registry: &str) -> Result<Option<Credential>> {
        match (
            std::env::var(&self.username_variable),
            std::env::var(&self.password_variable),
        ) {
            (Ok(username), Ok(password)) => Ok(Some(Credential::basic(username, password))),
            _ => Ok(None),
        }
    }

    fn description(&self) -> String {
        format!(
            "environment variables {}/{}",
            self.username_variable, self.password_variable
        )
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerConfigAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// Reads `config.json` the way the Docker CLI writes it.
///
/// The directory comes from `DOCKER_CONFIG`, an explicit override, or
/// `~/.docker`. Docker Hub is stored under several historical keys, all of
/// which are tried.
pub struct DockerConfigRetriever {
    config_dir: Option<PathBuf>,
}

impl DockerConfigRetriever {
    pub fn new() -> Self {
        Self { config_dir: None }
    }

    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(config_dir.into()),
        }
    }

    fn config_path(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.config_dir {
            return Some(dir.join("config.json"));
        }
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker/config.json"))
    }

    fn registry_aliases(registry: &str) -> Vec<String> {
        let mut aliases = vec![
            registry.to_string(),
            format!("https://{}", registry),
            format!("https://{}/", registry),
        ];
        if registry == DOCKER_HUB_REGISTRY {
            aliases.extend(
                [
                    "https://index.docker.io/v1/",
                    "index.docker.io",
                    "docker.io",
                ]
                .map(String::from),
            );
        }
        aliases
    }

    fn decode(entry: &DockerConfigAuth) -> Result<Option<Credential>> {
        if let Some(token) = &entry.identitytoken {
            return Ok(Some(Credential::Token(token.clone())));
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Credential::basic(username, password)));
        }
        if let Some(auth) = &entry.auth {
            let decoded = BASE64.decode(auth).map_err(|e| {
                BuildError::InvalidConfiguration(format!(
                    "Docker config 'auth' field is not valid base64: {}",
                    e
                ))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|e| {
                BuildError::InvalidConfiguration(format!(
                    "Docker config 'auth' field is not UTF-8: {}",
                    e
                ))
            })?;
            if let Some((username, password)) = decoded.split_once(':') {
                return Ok(Some(Credential::basic(username, password)));
            }
        }
        Ok(None)
    }
}

impl Default for DockerConfigRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialRetriever for DockerConfigRetriever {
    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        let Some(path) = self.config_path() else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: DockerConfigFile = serde_json::from_slice(&bytes)?;

        for alias in Self::registry_aliases(registry) {
            if let Some(entry) = config.auths.get(&alias) {
                if let Some(credential) = Self::decode(entry)? {
                    return Ok(Some(credential));
                }
            }
        }
        Ok(None)
    }

    fn description(&self) -> String {
        "Docker config.json".to_string()
    }
}

/// Run the retriever chain in order; the first credential wins. `Ok(None)`
/// means every retriever came up empty, which is fine for anonymous pulls.
pub async fn resolve_credential(
    retrievers: &[std::sync::Arc<dyn CredentialRetriever>],
    registry: &str,
) -> Result<Option<Credential>> {
    for retriever in retrievers {
        if let Some(credential) = retriever.retrieve(registry).await? {
            return Ok(Some(credential));
        }
    }
    Ok(None)
}
