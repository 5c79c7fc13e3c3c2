//! Docker Registry HTTP API v2 client
//!
//! One client per `(registry, repository)` pair. The client is stateless
//! between calls; authorization is attached per request from the enclosing
//! [`RegistryAuthenticator`], which negotiates challenges and caches tokens
//! per scope. Idempotent reads retry with exponential backoff; uploads are
//! never retried mid-stream, a failed upload restarts its session.

use std::io::Write;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncReadExt;

use crate::credentials::Credential;
use crate::digest::{Digest, DigestBuilder};
use crate::error::{BuildError, Result};
use crate::executor::CancelToken;
use crate::image::manifest::{self, Manifest, RawManifest, select_platform};
use crate::progress::{Allocation, EventDispatcher};
use crate::registry::auth::{AuthChallenge, RegistryAuthenticator};

const MAX_READ_ATTEMPTS: usize = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const UPLOAD_CHUNK: usize = 64 * 1024;

fn backoff_delay(attempt: usize) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(10) as u32)
        .min(BACKOFF_CAP)
}

/// Outcome of a cross-repository mount attempt.
#[derive(Debug)]
pub enum BlobMount {
    /// `201 Created`: the registry linked the blob, nothing to upload.
    Mounted,
    /// `202 Accepted`: mount declined, fall through to a regular upload
    /// using the returned session URL.
    Session(String),
}

pub struct RegistryClientBuilder {
    registry: String,
    repository: String,
    credential: Option<Credential>,
    retrievers_tried: usize,
    allow_insecure: bool,
    send_credentials_over_http: bool,
    timeout: Duration,
    events: EventDispatcher,
    cancel: CancelToken,
}

impl RegistryClientBuilder {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            credential: None,
            retrievers_tried: 0,
            allow_insecure: false,
            send_credentials_over_http: false,
            timeout: crate::config::DEFAULT_HTTP_TIMEOUT,
            events: EventDispatcher::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_retrievers_tried(mut self, count: usize) -> Self {
        self.retrievers_tried = count;
        self
    }

    pub fn with_allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    pub fn with_send_credentials_over_http(mut self, send: bool) -> Self {
        self.send_credentials_over_http = send;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder()
            .connect_timeout(self.timeout)
            .read_timeout(self.timeout);
        if self.allow_insecure {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder.build()?;

        let authenticator = RegistryAuthenticator::new(
            client.clone(),
            self.registry.clone(),
            self.credential,
            self.retrievers_tried,
        );

        Ok(RegistryClient {
            client,
            registry: self.registry,
            repository: self.repository,
            scheme: RwLock::new("https"),
            authenticator,
            allow_insecure: self.allow_insecure,
            send_credentials_over_http: self.send_credentials_over_http,
            events: self.events,
            cancel: self.cancel,
        })
    }
}

pub struct RegistryClient {
    client: Client,
    registry: String,
    repository: String,
    scheme: RwLock<&'static str>,
    authenticator: RegistryAuthenticator,
    allow_insecure: bool,
    send_credentials_over_http: bool,
    events: EventDispatcher,
    cancel: CancelToken,
}

impl RegistryClient {
    pub fn builder(
        registry: impl Into<String>,
        repository: impl Into<String>,
    ) -> RegistryClientBuilder {
        RegistryClientBuilder::new(registry, repository)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn base_url(&self) -> String {
        format!(
            "{}://{}",
            self.scheme.read().expect("scheme lock poisoned"),
            self.registry
        )
    }

    fn using_plain_http(&self) -> bool {
        *self.scheme.read().expect("scheme lock poisoned") == "http"
    }

    fn fall_back_to_http(&self) -> bool {
        if !self.allow_insecure || self.using_plain_http() {
            return false;
        }
        self.events.warn(format!(
            "registry {} unreachable over HTTPS, retrying over HTTP",
            self.registry
        ));
        *self.scheme.write().expect("scheme lock poisoned") = "http";
        true
    }

    fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    fn push_scope(&self) -> String {
        format!("repository:{}:pull,push", self.repository)
    }

    fn mount_scope(&self, from_repository: &str) -> String {
        format!(
            "repository:{}:pull,push repository:{}:pull",
            self.repository, from_repository
        )
    }

    /// Whether a URL points back at this registry host; authorization is
    /// only ever attached to such URLs.
    fn same_host(&self, url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|parsed| {
                let host = parsed.host_str()?.to_string();
                let with_port = match parsed.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                };
                Some(with_port == self.registry || with_port == strip_default_port(&self.registry))
            })
            .unwrap_or(false)
    }

    /// Run one request with authentication negotiation: send, answer a 401
    /// challenge, resend. Credentials are withheld over plain HTTP unless
    /// explicitly permitted.
    async fn send_with_auth<F>(&self, scope: &str, make: &F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> reqwest::RequestBuilder,
    {
        let base = self.base_url();
        let credentials_allowed = !self.using_plain_http() || self.send_credentials_over_http;

        let mut request = make(&self.client, &base);
        if credentials_allowed {
            if let Some(header) = self.authenticator.cached(scope) {
                request = header.apply(request);
            }
        }
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = match response.headers().get(WWW_AUTHENTICATE) {
            Some(value) => AuthChallenge::parse(value.to_str().map_err(|e| {
                BuildError::RegistryTransport(format!("unreadable WWW-Authenticate header: {}", e))
            })?)?,
            None => {
                return Err(BuildError::RegistryUnauthorized {
                    registry: self.registry.clone(),
                    repository: self.repository.clone(),
                    message: "401 without a WWW-Authenticate challenge".to_string(),
                });
            }
        };

        if !credentials_allowed {
            return Err(BuildError::RegistryUnauthorized {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                message: "authentication required but credentials are withheld over plain HTTP"
                    .to_string(),
            });
        }

        // A cached token that just bounced is stale; renegotiate under the
        // per-scope lock and retry once.
        self.authenticator.invalidate(scope);
        let header = self.authenticator.authenticate(&challenge, scope).await?;
        let response = header.apply(make(&self.client, &base)).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(self.status_error(response).await);
        }
        Ok(response)
    }

    /// Transport-level retry loop. Reads retry up to five times on
    /// connection failures and 5xx answers with exponential backoff;
    /// writes go out once, though an HTTPS-to-HTTP fallback retry is
    /// allowed when the connection itself failed.
    async fn execute<F>(&self, scope: &str, idempotent: bool, make: F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            self.cancel.check()?;
            let outcome = self.send_with_auth(scope, &make).await;

            let retryable = match &outcome {
                Ok(response) => idempotent && response.status().is_server_error(),
                Err(BuildError::RegistryTransport(_)) => {
                    // Connection-level failures never consumed the request
                    // body; the HTTP fallback applies even to writes.
                    self.fall_back_to_http() || idempotent
                }
                Err(_) => false,
            };
            if !retryable || attempt + 1 >= MAX_READ_ATTEMPTS {
                return outcome;
            }

            let delay = backoff_delay(attempt);
            attempt += 1;
            self.events.debug(format!(
                "retrying {} request (attempt {}) after {:?}",
                self.registry,
                attempt + 1,
                delay
            ));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
            }
        }
    }

    /// Map a non-success response onto the error taxonomy: 401/403 are
    /// permission failures, a well-formed error document is a registry
    /// error, anything else is a transport failure.
    async fn status_error(&self, response: Response) -> BuildError {
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return BuildError::RegistryUnauthorized {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                message: format!("{}: {}", status, String::from_utf8_lossy(&body)),
            };
        }

        #[derive(serde::Deserialize)]
        struct ErrorDocument {
            errors: Vec<ErrorEntry>,
        }
        #[derive(serde::Deserialize)]
        struct ErrorEntry {
            #[serde(default)]
            code: String,
            #[serde(default)]
            message: String,
        }
        if let Ok(document) = serde_json::from_slice::<ErrorDocument>(&body) {
            if let Some(entry) = document.errors.first() {
                return BuildError::RegistryError {
                    code: entry.code.clone(),
                    message: entry.message.clone(),
                };
            }
        }

        BuildError::RegistryTransport(format!(
            "registry {} answered {} for {}: {}",
            self.registry,
            status,
            self.repository,
            String::from_utf8_lossy(&body[..body.len().min(200)])
        ))
    }

    /// `GET /v2/<name>/manifests/<ref>` with the full `Accept` list.
    pub async fn pull_manifest(&self, reference: &str) -> Result<RawManifest> {
        let repository = self.repository.clone();
        let reference_owned = reference.to_string();
        let response = self
            .execute(&self.pull_scope(), true, move |client, base| {
                client
                    .get(format!(
                        "{}/v2/{}/manifests/{}",
                        base, repository, reference_owned
                    ))
                    .header(ACCEPT, manifest::accept_header())
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        RawManifest::from_bytes(bytes.to_vec(), content_type.as_deref())
    }

    /// Pull a manifest, resolving manifest lists to the child matching the
    /// target platform.
    pub async fn pull_manifest_for_platform(
        &self,
        reference: &str,
        architecture: &str,
        os: &str,
    ) -> Result<RawManifest> {
        let raw = self.pull_manifest(reference).await?;
        match &raw.manifest {
            Manifest::List(list) => {
                let child = select_platform(list, architecture, os)?;
                self.pull_manifest(&child.digest.to_string()).await
            }
            _ => Ok(raw),
        }
    }

    /// `HEAD /v2/<name>/blobs/<digest>`: `Some(len)` when present.
    pub async fn blob_exists(&self, digest: &Digest, for_push: bool) -> Result<Option<u64>> {
        let scope = if for_push {
            self.push_scope()
        } else {
            self.pull_scope()
        };
        let repository = self.repository.clone();
        let digest_owned = digest.to_string();
        let response = self
            .execute(&scope, true, move |client, base| {
                client.head(format!("{}/v2/{}/blobs/{}", base, repository, digest_owned))
            })
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.content_length().or(Some(0))),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self.status_error(response).await),
        }
    }

    /// Stream a blob into `out`, verifying the digest as bytes arrive.
    /// The stream is aborted on size overrun and the digest checked at the
    /// end; redirects to blob storage hosts are followed without
    /// forwarding credentials.
    pub async fn pull_blob(
        &self,
        digest: &Digest,
        expected_size: Option<u64>,
        out: &mut (dyn Write + Send),
        progress: Option<&Arc<Allocation>>,
    ) -> Result<u64> {
        use futures_util::StreamExt;

        let repository = self.repository.clone();
        let digest_owned = digest.to_string();
        let response = self
            .execute(&self.pull_scope(), true, move |client, base| {
                client.get(format!("{}/v2/{}/blobs/{}", base, repository, digest_owned))
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        let mut hasher = DigestBuilder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.cancel.check()?;
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk)?;
            if let Some(expected) = expected_size {
                if hasher.bytes_seen() > expected {
                    return Err(BuildError::RegistryTransport(format!(
                        "blob {} exceeded its declared size of {} bytes",
                        digest, expected
                    )));
                }
            }
            if let Some(allocation) = progress {
                self.events.progress(allocation, chunk.len() as u64);
            }
        }

        let size = hasher.bytes_seen();
        let actual = hasher.finish();
        if &actual != digest {
            return Err(BuildError::RegistryTransport(format!(
                "blob digest mismatch: expected {}, received {}",
                digest, actual
            )));
        }
        if let Some(expected) = expected_size {
            if size != expected {
                return Err(BuildError::RegistryTransport(format!(
                    "blob {} is {} bytes, expected {}",
                    digest, size, expected
                )));
            }
        }
        Ok(size)
    }

    /// `POST .../blobs/uploads/?mount=<digest>&from=<repo>`.
    pub async fn mount_blob(&self, digest: &Digest, from_repository: &str) -> Result<BlobMount> {
        let repository = self.repository.clone();
        let digest_owned = digest.to_string();
        let from_owned = from_repository.to_string();
        let response = self
            .execute(
                &self.mount_scope(from_repository),
                false,
                move |client, base| {
                    client.post(format!(
                        "{}/v2/{}/blobs/uploads/?mount={}&from={}",
                        base, repository, digest_owned, from_owned
                    ))
                },
            )
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(BlobMount::Mounted),
            StatusCode::ACCEPTED => {
                let location = self.location_of(&response)?;
                Ok(BlobMount::Session(location))
            }
            _ => Err(self.status_error(response).await),
        }
    }

    /// `POST .../blobs/uploads/`: open an upload session.
    pub async fn start_blob_upload(&self) -> Result<String> {
        let repository = self.repository.clone();
        let response = self
            .execute(&self.push_scope(), false, move |client, base| {
                client.post(format!("{}/v2/{}/blobs/uploads/", base, repository))
            })
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(self.status_error(response).await);
        }
        self.location_of(&response)
    }

    /// Single-shot upload into an open session: `PATCH` the bytes, then
    /// `PUT ?digest=` to commit.
    pub async fn upload_blob(
        &self,
        session_url: &str,
        digest: &Digest,
        source: &std::path::Path,
        progress: Option<&Arc<Allocation>>,
    ) -> Result<()> {
        let scope = self.push_scope();

        let body = self.file_body(source, progress.cloned()).await?;
        let mut request = self
            .client
            .patch(session_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        request = self.apply_session_auth(request, session_url, &scope).await?;
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        let commit_base = self
            .location_of(&response)
            .unwrap_or_else(|_| session_url.to_string());

        let separator = if commit_base.contains('?') { '&' } else { '?' };
        let commit_url = format!("{}{}digest={}", commit_base, separator, digest);
        let mut request = self.client.put(&commit_url);
        request = self.apply_session_auth(request, &commit_url, &scope).await?;
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        Ok(())
    }

    /// Single-shot upload of an in-memory blob, e.g. the container config.
    pub async fn upload_blob_data(
        &self,
        session_url: &str,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<()> {
        let scope = self.push_scope();

        let mut request = self
            .client
            .patch(session_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        request = self.apply_session_auth(request, session_url, &scope).await?;
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        let commit_base = self
            .location_of(&response)
            .unwrap_or_else(|_| session_url.to_string());

        let separator = if commit_base.contains('?') { '&' } else { '?' };
        let commit_url = format!("{}{}digest={}", commit_base, separator, digest);
        let mut request = self.client.put(&commit_url);
        request = self.apply_session_auth(request, &commit_url, &scope).await?;
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        Ok(())
    }

    /// `PUT /v2/<name>/manifests/<ref>`. The body is the exact byte
    /// sequence whose SHA-256 is the manifest digest.
    pub async fn push_manifest(&self, raw: &RawManifest, reference: &str) -> Result<()> {
        let repository = self.repository.clone();
        let reference_owned = reference.to_string();
        let media_type = raw.manifest.media_type().to_string();
        let bytes = raw.bytes.clone();
        let response = self
            .execute(&self.push_scope(), false, move |client, base| {
                client
                    .put(format!(
                        "{}/v2/{}/manifests/{}",
                        base, repository, reference_owned
                    ))
                    .header(CONTENT_TYPE, media_type.clone())
                    .body(bytes.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        Ok(())
    }

    /// Attach the cached push authorization to a session request, but only
    /// when the session URL still points at this registry.
    async fn apply_session_auth(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
        scope: &str,
    ) -> Result<reqwest::RequestBuilder> {
        if !self.same_host(url) {
            return Ok(request);
        }
        if self.using_plain_http() && !self.send_credentials_over_http {
            return Ok(request);
        }
        match self.authenticator.cached(scope) {
            Some(header) => Ok(header.apply(request)),
            None => Ok(request),
        }
    }

    /// Streamed request body from a file, reporting progress per chunk and
    /// aborting promptly on cancellation.
    async fn file_body(
        &self,
        path: &std::path::Path,
        progress: Option<Arc<Allocation>>,
    ) -> Result<reqwest::Body> {
        let file = tokio::fs::File::open(path).await?;
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        let stream = futures_util::stream::unfold(
            (file, events, cancel, progress),
            |(mut file, events, cancel, progress)| async move {
                if cancel.is_cancelled() {
                    return Some((
                        Err(std::io::Error::other("build cancelled")),
                        (file, events, cancel, progress),
                    ));
                }
                let mut buffer = vec![0u8; UPLOAD_CHUNK];
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buffer.truncate(n);
                        if let Some(allocation) = &progress {
                            events.progress(allocation, n as u64);
                        }
                        Some((Ok(buffer), (file, events, cancel, progress)))
                    }
                    Err(e) => Some((Err(e), (file, events, cancel, progress))),
                }
            },
        );
        Ok(reqwest::Body::wrap_stream(stream))
    }

    /// Absolute form of a `Location` header; relative values resolve
    /// against the registry base URL.
    fn location_of(&self, response: &Response) -> Result<String> {
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| {
                BuildError::RegistryTransport(
                    "registry response is missing a Location header".to_string(),
                )
            })?
            .to_str()
            .map_err(|e| {
                BuildError::RegistryTransport(format!("unreadable Location header: {}", e))
            })?;
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(location.to_string())
        } else if location.starts_with('/') {
            Ok(format!("{}{}", self.base_url(), location))
        } else {
            Ok(format!("{}/{}", self.base_url(), location))
        }
    }
}

fn strip_default_port(registry: &str) -> String {
    registry
        .strip_suffix(":443")
        .or_else(|| registry.strip_suffix(":80"))
        .unwrap_or(registry)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RegistryClient {
        RegistryClient::builder("registry.example", "my/app")
            .build()
            .unwrap()
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(250));
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(5), Duration::from_secs(8));
        assert_eq!(backoff_delay(9), Duration::from_secs(8));
    }

    #[test]
    fn scopes_follow_the_distribution_convention() {
        let client = client();
        assert_eq!(client.pull_scope(), "repository:my/app:pull");
        assert_eq!(client.push_scope(), "repository:my/app:pull,push");
        assert_eq!(
            client.mount_scope("src/base"),
            "repository:my/app:pull,push repository:src/base:pull"
        );
    }

    #[test]
    fn same_host_never_matches_blob_storage() {
        let client = client();
        assert!(client.same_host("https://registry.example/v2/my/app/blobs/uploads/abc"));
        assert!(!client.same_host("https://storage.example/presigned/xyz"));
        assert!(!client.same_host("not a url"));
    }

    #[test]
    fn default_scheme_is_https_with_opt_in_fallback() {
        let secure = client();
        assert_eq!(secure.base_url(), "https://registry.example");
        assert!(!secure.fall_back_to_http());
        assert_eq!(secure.base_url(), "https://registry.example");

        let insecure = RegistryClient::builder("registry.example", "my/app")
            .with_allow_insecure(true)
            .with_events(EventDispatcher::new())
            .build()
            .unwrap();
        assert!(insecure.fall_back_to_http());
        assert_eq!(insecure.base_url(), "http://registry.example");
        // Second fallback is a no-op.
        assert!(!insecure.fall_back_to_http());
    }
}
