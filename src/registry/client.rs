//! Registry Client (C1): resolves `image:tag` to a manifest digest, with
//! caching, retry, and authentication.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use sha2::{Digest as _, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorKind, Result};
use crate::model::{DigestCacheEntry, ImageRef};
use crate::registry::auth::{self, Credentials};
use crate::registry::cache::DigestCache;

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// Result of a successful `resolve` call.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub digest: String,
    pub size_bytes: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub security_advisory: bool,
}

/// Resolves image references against OCI distribution-spec v1.0+ registries
/// (Docker Hub, Harbor, generic), authenticating per-registry and caching
/// results with a jittered TTL.
pub struct RegistryClient {
    http: reqwest::Client,
    cache: DigestCache,
    credentials: RwLock<HashMap<String, Credentials>>,
    /// Registry hosts to address over plain HTTP instead of TLS — for
    /// local/test registries only, never enabled by default.
    insecure_registries: RwLock<HashSet<String>>,
}

impl RegistryClient {
    pub fn new(digest_cache_ttl_sec: i64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder should not fail with default TLS settings");

        Self {
            http,
            cache: DigestCache::new(digest_cache_ttl_sec),
            credentials: RwLock::new(HashMap::new()),
            insecure_registries: RwLock::new(HashSet::new()),
        }
    }

    /// Registers credentials for a registry host; subsequent `resolve` calls
    /// against that host use them.
    pub async fn authenticate(&self, registry: impl Into<String>, credentials: Credentials) {
        self.credentials.write().await.insert(registry.into(), credentials);
    }

    /// Marks a registry host as plain-HTTP. Intended for local/CI registries;
    /// never set this for a host reachable over the public internet.
    pub async fn allow_insecure(&self, registry: impl Into<String>) {
        self.insecure_registries.write().await.insert(registry.into());
    }

    async fn scheme_for(&self, registry: &str) -> &'static str {
        if self.insecure_registries.read().await.contains(registry) {
            "http"
        } else {
            "https"
        }
    }

    async fn credentials_for(&self, registry: &str) -> Credentials {
        self.credentials
            .read()
            .await
            .get(registry)
            .cloned()
            .unwrap_or(Credentials::Anonymous)
    }

    /// Resolves `image_ref` to its current digest, consulting the cache
    /// first. On a cache miss, issues `HEAD /v2/{repo}/manifests/{tag}` and
    /// retries transient failures up to 3 times with exponential backoff
    /// (1s, 3s, 9s) within this single call.
    pub async fn resolve(&self, image_ref: &ImageRef) -> Result<ResolvedImage> {
        if let Some(cached) = self
            .cache
            .get(&image_ref.registry, &image_ref.repository, &image_ref.tag)
        {
            if cached.is_negative {
                return Err(EngineError::new(ErrorKind::ImageNotFound, "cached negative result"));
            }
            return Ok(ResolvedImage {
                digest: cached.digest,
                size_bytes: cached.size_bytes,
                published_at: cached.published_at,
                security_advisory: false,
            });
        }

        let credentials = self.credentials_for(&image_ref.registry).await;
        let result = self.resolve_with_retry(image_ref, &credentials).await;

        match &result {
            Ok(resolved) => {
                self.cache.put(DigestCacheEntry {
                    registry: image_ref.registry.clone(),
                    repository: image_ref.repository.clone(),
                    tag: image_ref.tag.clone(),
                    digest: resolved.digest.clone(),
                    size_bytes: resolved.size_bytes,
                    published_at: resolved.published_at,
                    fetched_at: Utc::now(),
                    is_negative: false,
                });
            }
            Err(e) if !e.retryable() => {
                self.cache.put(DigestCacheEntry {
                    registry: image_ref.registry.clone(),
                    repository: image_ref.repository.clone(),
                    tag: image_ref.tag.clone(),
                    digest: String::new(),
                    size_bytes: 0,
                    published_at: None,
                    fetched_at: Utc::now(),
                    is_negative: true,
                });
            }
            Err(_) => {}
        }

        result
    }

    async fn resolve_with_retry(
        &self,
        image_ref: &ImageRef,
        credentials: &Credentials,
    ) -> Result<ResolvedImage> {
        // Initial attempt plus up to 3 retries, delayed 1s/3s/9s.
        const RETRY_DELAYS_SEC: [u64; 3] = [1, 3, 9];

        let mut last_err = None;

        for attempt in 0..=RETRY_DELAYS_SEC.len() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAYS_SEC[attempt - 1])).await;
            }

            match self.resolve_once(image_ref, credentials).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) if !e.retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "registry resolve attempt {} failed for {}: {}",
                        attempt + 1,
                        image_ref.full_name(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EngineError::new(ErrorKind::RegistryUnavailable, "registry unreachable after retries")
        }))
    }

    async fn resolve_once(&self, image_ref: &ImageRef, credentials: &Credentials) -> Result<ResolvedImage> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme_for(&image_ref.registry).await,
            image_ref.registry,
            image_ref.repository,
            image_ref.tag
        );

        let mut headers = auth::base_headers(credentials)?;
        headers.insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));

        let resp = self.send_with_auth(reqwest::Method::HEAD, &url, &headers, credentials).await?;

        match resp.status() {
            StatusCode::OK => self.parse_head_response(resp, image_ref, credentials).await,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(EngineError::new(ErrorKind::AuthFailed, "registry rejected credentials"))
            }
            StatusCode::NOT_FOUND => Err(EngineError::new(ErrorKind::ImageNotFound, "tag or repository not found")),
            status if status.is_server_error() => Err(EngineError::new(
                ErrorKind::RegistryUnavailable,
                format!("registry returned {}", status),
            )),
            status => Err(EngineError::new(
                ErrorKind::RegistryUnavailable,
                format!("unexpected registry response {}", status),
            )),
        }
    }

    async fn send_with_auth(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &HeaderMap,
        credentials: &Credentials,
    ) -> Result<reqwest::Response> {
        let first = self
            .http
            .request(method.clone(), url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| EngineError::with_source(ErrorKind::RegistryUnavailable, "registry unreachable", e))?;

        if first.status() != StatusCode::UNAUTHORIZED {
            return Ok(first);
        }

        let challenge = auth::extract_challenge(first.headers());
        let Some(challenge) = challenge else {
            return Ok(first);
        };

        let token = auth::fetch_bearer_token(&self.http, &challenge, credentials).await?;
        let mut retry_headers = headers.clone();
        retry_headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| EngineError::with_source(ErrorKind::InternalError, "invalid token header", e))?,
        );

        self.http
            .request(method, url)
            .headers(retry_headers)
            .send()
            .await
            .map_err(|e| EngineError::with_source(ErrorKind::RegistryUnavailable, "registry unreachable", e))
    }

    async fn parse_head_response(
        &self,
        resp: reqwest::Response,
        image_ref: &ImageRef,
        credentials: &Credentials,
    ) -> Result<ResolvedImage> {
        let size_bytes = resp
            .content_length()
            .or_else(|| {
                resp.headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(0);

        let security_advisory = resp
            .headers()
            .get("docker-security-advisory")
            .is_some();

        let digest_header = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let digest = match digest_header {
            Some(d) => d,
            None => {
                debug!(
                    "no Docker-Content-Digest header for {}, falling back to GET+hash",
                    image_ref.full_name()
                );
                self.fetch_and_hash_manifest(image_ref, credentials).await?
            }
        };

        Ok(ResolvedImage {
            digest,
            size_bytes,
            published_at: None,
            security_advisory,
        })
    }

    /// Fallback for registries that omit `Docker-Content-Digest`: fetch the
    /// manifest body and hash it ourselves.
    async fn fetch_and_hash_manifest(&self, image_ref: &ImageRef, credentials: &Credentials) -> Result<String> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme_for(&image_ref.registry).await,
            image_ref.registry,
            image_ref.repository,
            image_ref.tag
        );
        let mut headers = auth::base_headers(credentials)?;
        headers.insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));

        let resp = self.send_with_auth(reqwest::Method::GET, &url, &headers, credentials).await?;
        if !resp.status().is_success() {
            return Err(EngineError::new(
                ErrorKind::RegistryUnavailable,
                format!("manifest GET returned {}", resp.status()),
            ));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::with_source(ErrorKind::RegistryUnavailable, "failed reading manifest body", e))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn invalidate(&self, image_ref: &ImageRef) {
        self.cache.invalidate(&image_ref.registry, &image_ref.repository, &image_ref.tag);
    }
}

pub type SharedRegistryClient = Arc<RegistryClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_digest_from_head_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/v2/library/nginx/manifests/1.24.0")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:bbb")
            .with_header("content-length", "1234")
            .create_async()
            .await;

        let client = RegistryClient::new(600);
        let host = server.host_with_port();
        client.allow_insecure(host.clone()).await;
        let image_ref = ImageRef::new(host, "library/nginx").with_tag("1.24.0");

        let resolved = client.resolve(&image_ref).await.unwrap();
        assert_eq!(resolved.digest, "sha256:bbb");
        assert_eq!(resolved.size_bytes, 1234);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_not_retried_and_is_negative_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/v2/library/missing/manifests/latest")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = RegistryClient::new(600);
        client.allow_insecure(server.host_with_port()).await;
        let image_ref = ImageRef::new(server.host_with_port(), "library/missing");

        let err = client.resolve(&image_ref).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageNotFound);

        // Second call hits the negative cache, not the server.
        let err2 = client.resolve(&image_ref).await.unwrap_err();
        assert_eq!(err2.kind(), ErrorKind::ImageNotFound);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn auth_failure_is_surfaced_immediately() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/v2/library/nginx/manifests/latest")
            .with_status(401)
            .create_async()
            .await;

        let client = RegistryClient::new(600);
        client.allow_insecure(server.host_with_port()).await;
        let image_ref = ImageRef::new(server.host_with_port(), "library/nginx");

        let err = client.resolve(&image_ref).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailed);
    }
}
