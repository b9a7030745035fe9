//! Registry authentication: anonymous, basic, and bearer-token-with-challenge.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use serde::Deserialize;

use crate::error::{EngineError, ErrorKind, Result};

/// Credentials configured for one registry host.
#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// Delegates to an external credential helper (e.g. an OS keychain or a
    /// cloud registry's token-exchange CLI); the helper is invoked once per
    /// challenge and its stdout is treated as a bearer token.
    CredentialHelper { helper_path: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parses a `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
/// challenge header into its components.
#[derive(Debug, Clone)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for part in split_params(rest) {
            let (key, value) = part.split_once('=')?;
            let value = value.trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

fn split_params(s: &str) -> Vec<&str> {
    // Params are comma-separated but values may themselves be quoted;
    // none of realm/service/scope are expected to contain commas so a plain
    // split is sufficient here.
    s.split(',').collect()
}

/// Resolves a bearer token for the given challenge, applying `credentials`.
pub async fn fetch_bearer_token(
    client: &reqwest::Client,
    challenge: &BearerChallenge,
    credentials: &Credentials,
) -> Result<String> {
    let mut query: HashMap<&str, &str> = HashMap::new();
    if let Some(service) = &challenge.service {
        query.insert("service", service);
    }
    if let Some(scope) = &challenge.scope {
        query.insert("scope", scope);
    }

    let mut req = client.get(&challenge.realm).query(&query);

    match credentials {
        Credentials::Anonymous => {}
        Credentials::Basic { username, password } => {
            req = req.basic_auth(username, Some(password));
        }
        Credentials::CredentialHelper { helper_path } => {
            let token = run_credential_helper(helper_path).await?;
            return Ok(token);
        }
    }

    let resp = req.send().await.map_err(|e| {
        EngineError::with_source(ErrorKind::RegistryUnavailable, "token endpoint unreachable", e)
    })?;

    if resp.status() == reqwest::StatusCode::UNAUTHORIZED
        || resp.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(EngineError::new(ErrorKind::AuthFailed, "token endpoint rejected credentials"));
    }
    if !resp.status().is_success() {
        return Err(EngineError::new(
            ErrorKind::RegistryUnavailable,
            format!("token endpoint returned {}", resp.status()),
        ));
    }

    let body: TokenResponse = resp.json().await.map_err(|e| {
        EngineError::with_source(ErrorKind::RegistryUnavailable, "token endpoint returned invalid json", e)
    })?;

    body.token
        .or(body.access_token)
        .ok_or_else(|| EngineError::new(ErrorKind::AuthFailed, "token endpoint returned no token"))
}

async fn run_credential_helper(helper_path: &str) -> Result<String> {
    let output = tokio::process::Command::new(helper_path)
        .output()
        .await
        .map_err(|e| {
            EngineError::with_source(ErrorKind::AuthFailed, "credential helper failed to run", e)
        })?;

    if !output.status.success() {
        return Err(EngineError::new(
            ErrorKind::AuthFailed,
            "credential helper exited with a non-zero status",
        ));
    }

    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            EngineError::with_source(ErrorKind::AuthFailed, "credential helper produced invalid utf-8", e)
        })
}

/// Builds the initial request headers for anonymous/basic auth; bearer auth
/// is applied per-challenge by `fetch_bearer_token` + a follow-up request.
pub fn base_headers(credentials: &Credentials) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Credentials::Basic { username, password } = credentials {
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", username, password),
        );
        let value = HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| EngineError::with_source(ErrorKind::InvalidConfig, "invalid credentials", e))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

pub fn extract_challenge(headers: &HeaderMap) -> Option<BearerChallenge> {
    headers
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(BearerChallenge::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let challenge = BearerChallenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/nginx:pull"));
    }

    #[test]
    fn rejects_non_bearer_challenge() {
        assert!(BearerChallenge::parse("Basic realm=\"x\"").is_none());
    }
}
