//! Registry authentication negotiation
//!
//! Calls go out unauthenticated first; a `401 Unauthorized` answer carries a
//! `WWW-Authenticate` challenge that is either `Basic` (retry with stored
//! credentials) or `Bearer` (fetch a token from the named realm, itself
//! authenticated with the stored credentials, then retry). Tokens are cached
//! per scope; a refresh race is resolved by a per-scope mutex so ten
//! parallel pulls cost exactly one token fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use reqwest::Client;
use serde::Deserialize;

use crate::credentials::Credential;
use crate::error::{BuildError, Result};

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic {
        realm: String,
    },
    Bearer {
        realm: String,
        service: String,
        scope: Option<String>,
    },
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let (scheme, params) = match header.split_once(' ') {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };
        let params = parse_challenge_params(params);

        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthChallenge::Basic {
                realm: params.get("realm").cloned().unwrap_or_default(),
            }),
            "bearer" => {
                let realm = params.get("realm").cloned().ok_or_else(|| {
                    BuildError::RegistryTransport(
                        "Bearer challenge without a realm".to_string(),
                    )
                })?;
                Ok(AuthChallenge::Bearer {
                    realm,
                    service: params.get("service").cloned().unwrap_or_default(),
                    scope: params.get("scope").cloned(),
                })
            }
            other => Err(BuildError::RegistryTransport(format!(
                "unsupported authentication scheme '{}'",
                other
            ))),
        }
    }
}

/// Split `key="value"` pairs on commas, honouring quotes; bearer scopes may
/// contain commas inside a quoted value.
fn parse_challenge_params(params: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest.get(end..).unwrap_or("");
        }
        rest = rest.trim_start_matches(',').trim_start();
        if !key.is_empty() {
            result.insert(key, value);
        }
    }
    result
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Authorization to attach to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthHeader {
    Bearer(String),
    Basic { username: String, password: String },
}

impl AuthHeader {
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthHeader::Bearer(token) => request.bearer_auth(token),
            AuthHeader::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

/// Owns the credential for one registry and the per-scope header cache.
pub struct RegistryAuthenticator {
    client: Client,
    registry: String,
    credential: Option<Credential>,
    retrievers_tried: usize,
    headers: RwLock<HashMap<String, AuthHeader>>,
    fetch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RegistryAuthenticator {
    pub fn new(
        client: Client,
        registry: impl Into<String>,
        credential: Option<Credential>,
        retrievers_tried: usize,
    ) -> Self {
        Self {
            client,
            registry: registry.into(),
            credential,
            retrievers_tried,
            headers: RwLock::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Cached header for a scope; lock-free after the first write.
    pub fn cached(&self, scope: &str) -> Option<AuthHeader> {
        self.headers
            .read()
            .expect("auth header cache poisoned")
            .get(scope)
            .cloned()
    }

    /// Drop a cached header after a `401` so the next call renegotiates.
    pub fn invalidate(&self, scope: &str) {
        self.headers
            .write()
            .expect("auth header cache poisoned")
            .remove(scope);
    }

    fn fetch_lock(&self, scope: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.fetch_locks
            .lock()
            .expect("auth fetch lock map poisoned")
            .entry(scope.to_string())
            .or_default()
            .clone()
    }

    /// Answer a challenge for a scope, caching the resulting header. The
    /// per-scope mutex collapses concurrent fetches into one.
    pub async fn authenticate(&self, challenge: &AuthChallenge, scope: &str) -> Result<AuthHeader> {
        let lock = self.fetch_lock(scope);
        let _guard = lock.lock().await;

        if let Some(header) = self.cached(scope) {
            return Ok(header);
        }

        let header = match challenge {
            AuthChallenge::Basic { .. } => match &self.credential {
                Some(Credential::Basic { username, password }) => AuthHeader::Basic {
                    username: username.clone(),
                    password: password.clone(),
                },
                Some(Credential::Token(token)) => AuthHeader::Bearer(token.clone()),
                None => return Err(self.authentication_failed()),
            },
            AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                if let Some(Credential::Token(token)) = &self.credential {
                    AuthHeader::Bearer(token.clone())
                } else {
                    let token = self
                        .fetch_bearer_token(
                            realm,
                            service,
                            challenge_scope.as_deref().unwrap_or(scope),
                        )
                        .await?;
                    AuthHeader::Bearer(token)
                }
            }
        };

        self.headers
            .write()
            .expect("auth header cache poisoned")
            .insert(scope.to_string(), header.clone());
        Ok(header)
    }

    /// Fetch a token from the challenge realm. Anonymous fetches are fine
    /// for public repositories; stored credentials ride along as HTTP Basic
    /// when present.
    async fn fetch_bearer_token(&self, realm: &str, service: &str, scope: &str) -> Result<String> {
        let mut request = self.client.get(realm).query(&[("service", service)]);
        // Cross-repository grants arrive as multiple space-separated
        // resource scopes, each sent as its own query parameter.
        for resource_scope in scope.split_whitespace() {
            request = request.query(&[("scope", resource_scope)]);
        }
        if let Some(Credential::Basic { username, password }) = &self.credential {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(self.authentication_failed());
        }
        if !status.is_success() {
            return Err(BuildError::RegistryTransport(format!(
                "token endpoint {} answered {}",
                realm, status
            )));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                BuildError::RegistryTransport(format!(
                    "token endpoint {} returned no token",
                    realm
                ))
            })
    }

    fn authentication_failed(&self) -> BuildError {
        BuildError::AuthenticationFailed {
            registry: self.registry.clone(),
            retrievers_tried: self.retrievers_tried,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example/token",service="reg.example",scope="repository:r:pull""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.example/token".to_string(),
                service: "reg.example".to_string(),
                scope: Some("repository:r:pull".to_string()),
            }
        );
    }

    #[test]
    fn parses_scope_with_embedded_comma() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example/token",service="reg.example",scope="repository:r:pull,push""#,
        )
        .unwrap();
        let AuthChallenge::Bearer { scope, .. } = challenge else {
            panic!("expected bearer");
        };
        assert_eq!(scope.as_deref(), Some("repository:r:pull,push"));
    }

    #[test]
    fn parses_basic_challenge() {
        let challenge = AuthChallenge::parse(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(
            challenge,
            AuthChallenge::Basic {
                realm: "Registry Realm".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_scheme_and_realmless_bearer() {
        assert!(AuthChallenge::parse("Digest realm=\"x\"").is_err());
        assert!(AuthChallenge::parse("Bearer service=\"reg\"").is_err());
    }

    #[tokio::test]
    async fn basic_challenge_without_credentials_fails_cleanly() {
        let authenticator = RegistryAuthenticator::new(
            Client::new(),
            "registry.example",
            None,
            2,
        );
        let challenge = AuthChallenge::Basic {
            realm: "x".to_string(),
        };
        let err = authenticator
            .authenticate(&challenge, "repository:r:pull")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::AuthenticationFailed {
                retrievers_tried: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn basic_challenge_with_credentials_caches_header() {
        let authenticator = RegistryAuthenticator::new(
            Client::new(),
            "registry.example",
            Some(Credential::basic("user", "pass")),
            1,
        );
        let challenge = AuthChallenge::Basic {
            realm: "x".to_string(),
        };
        let scope = "repository:r:pull";
        let header = authenticator.authenticate(&challenge, scope).await.unwrap();
        assert_eq!(
            header,
            AuthHeader::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }
        );
        assert_eq!(authenticator.cached(scope), Some(header));

        authenticator.invalidate(scope);
        assert!(authenticator.cached(scope).is_none());
    }

    #[tokio::test]
    async fn preissued_token_skips_the_token_endpoint() {
        let authenticator = RegistryAuthenticator::new(
            Client::new(),
            "registry.example",
            Some(Credential::Token("pre-issued".to_string())),
            1,
        );
        let challenge = AuthChallenge::Bearer {
            realm: "https://auth.unreachable.invalid/token".to_string(),
            service: "svc".to_string(),
            scope: None,
        };
        // Never touches the realm; the pre-issued token is used directly.
        let header = authenticator
            .authenticate(&challenge, "repository:r:pull")
            .await
            .unwrap();
        assert_eq!(header, AuthHeader::Bearer("pre-issued".to_string()));
    }
}
