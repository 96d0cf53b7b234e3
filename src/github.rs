//! GitHub API client for JIT runner token minting.
//!
//! Handles:
//! - Installation access token exchange (App JWT → installation token)
//! - Installation auto-discovery when no installation id is configured
//! - JIT runner config generation (installation token → one-time token)
//!
//! The two pipeline seams are the [`TokenExchanger`] and
//! [`JitTokenRequester`] traits, so the full pipeline runs against either
//! the real API or in-memory stubs. GitHub's request/response schemas are
//! a versioned external contract and stay isolated inside this module.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{GitHubConfig, HttpConfig, RunnerScope};
use crate::error::{Error, Result};
use crate::runner::RunnerSpec;
use crate::signer::SignedAssertion;

/// Installation access token obtained by exchanging an App assertion.
///
/// Held only in memory and discarded at process exit.
#[derive(Clone)]
pub struct ScopedAccessCredential {
    token: String,
    pub expires_at: DateTime<Utc>,
}

impl ScopedAccessCredential {
    pub fn new(token: String, expires_at: DateTime<Utc>) -> Self {
        Self { token, expires_at }
    }

    /// The bearer value, for the Authorization header.
    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

// Manual Debug: the bearer value is a credential, keep it out of logs.
impl std::fmt::Debug for ScopedAccessCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedAccessCredential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One-time JIT runner registration token, the pipeline's final artifact.
#[derive(Clone)]
pub struct RunnerRegistrationToken {
    encoded_jit_config: String,
    pub runner_id: u64,
    pub runner_name: String,
    pub expires_at: DateTime<Utc>,
}

impl RunnerRegistrationToken {
    pub fn new(
        encoded_jit_config: String,
        runner_id: u64,
        runner_name: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            encoded_jit_config,
            runner_id,
            runner_name,
            expires_at,
        }
    }

    /// The opaque encoded JIT config the runner binary consumes.
    pub fn encoded(&self) -> &str {
        &self.encoded_jit_config
    }

    /// No stage may extend the lifetime of the credential that produced it.
    pub fn clamp_expiry(&mut self, producer_expiry: DateTime<Utc>) {
        if self.expires_at > producer_expiry {
            self.expires_at = producer_expiry;
        }
    }
}

impl std::fmt::Debug for RunnerRegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistrationToken")
            .field("encoded_jit_config", &"<redacted>")
            .field("runner_id", &self.runner_id)
            .field("runner_name", &self.runner_name)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges a signed App assertion for an installation access token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, assertion: &SignedAssertion) -> Result<ScopedAccessCredential>;
}

/// Requests a one-time JIT registration token for a named runner.
#[async_trait]
pub trait JitTokenRequester: Send + Sync {
    async fn request_jit_token(
        &self,
        credential: &ScopedAccessCredential,
        spec: &RunnerSpec,
    ) -> Result<RunnerRegistrationToken>;
}

/// Which installation the access token should be scoped to.
#[derive(Debug, Clone)]
pub enum InstallationSelector {
    /// Known installation id (from config or a stage profile)
    Id(u64),
    /// Discover the installation covering this account via the API
    Account(String),
}

/// Pipeline stage a response belongs to, for error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiStage {
    Exchange,
    JitConfig,
}

/// Response from installation access token endpoint
#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

/// Request body for the generate-jitconfig endpoint
#[derive(Debug, Serialize)]
struct JitConfigRequest<'a> {
    name: &'a str,
    runner_group_id: u64,
    labels: &'a [String],
}

/// Response from the generate-jitconfig endpoint
#[derive(Debug, Deserialize)]
struct JitConfigResponse {
    runner: JitRunnerInfo,
    encoded_jit_config: String,
}

/// Allocated runner identity from the generate-jitconfig response
#[derive(Debug, Deserialize)]
struct JitRunnerInfo {
    id: u64,
    name: String,
}

/// Installation info from GitHub API
#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
    account: InstallationAccount,
}

/// Account info for an installation
#[derive(Debug, Deserialize)]
struct InstallationAccount {
    login: String,
}

/// GitHub API client implementing both network stages.
pub struct GitHubClient {
    api_url: String,
    installation: InstallationSelector,
    http_client: Client,
}

impl GitHubClient {
    /// Build a client from configuration. The installation is taken from
    /// config when present, otherwise discovered from the scope's account.
    pub fn new(github: &GitHubConfig, http: &HttpConfig, scope: &RunnerScope) -> Result<Self> {
        let installation = match github.installation_id {
            Some(id) => InstallationSelector::Id(id),
            None => InstallationSelector::Account(scope.account().to_lowercase()),
        };

        let http_client = Client::builder()
            .user_agent("fpga-runner-jit")
            .timeout(std::time::Duration::from_secs(http.request_timeout_secs))
            .build()
            .map_err(|e| Error::transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            api_url: github.api_url.trim_end_matches('/').to_string(),
            installation,
            http_client,
        })
    }

    /// Resolve the installation id, discovering it from the App's
    /// installations when only an account name is known.
    async fn resolve_installation_id(&self, jwt: &str) -> Result<u64> {
        let account = match &self.installation {
            InstallationSelector::Id(id) => return Ok(*id),
            InstallationSelector::Account(account) => account,
        };

        let url = format!("{}/app/installations", self.api_url);
        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;

        let response = check_response(ApiStage::Exchange, response).await?;
        let installations: Vec<Installation> = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("failed to parse installations: {e}")))?;

        debug!("Discovered {} App installation(s)", installations.len());

        installations
            .iter()
            .find(|i| i.account.login.to_lowercase() == *account)
            .map(|i| i.id)
            .ok_or_else(|| Error::AuthenticationRejected {
                status: Some(404),
                detail: format!("GitHub App is not installed on account '{account}'"),
            })
    }
}

#[async_trait]
impl TokenExchanger for GitHubClient {
    async fn exchange(&self, assertion: &SignedAssertion) -> Result<ScopedAccessCredential> {
        let installation_id = self.resolve_installation_id(assertion.jwt()).await?;

        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_url
        );
        debug!("Requesting installation access token for {installation_id}");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", assertion.jwt()))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;

        let response = check_response(ApiStage::Exchange, response).await?;
        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("failed to parse access token response: {e}")))?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .map_err(|e| Error::transport(format!("failed to parse token expiration: {e}")))?
            .with_timezone(&Utc);

        if expires_at <= Utc::now() {
            return Err(Error::AuthenticationRejected {
                status: Some(200),
                detail: "platform returned an already-expired access token".into(),
            });
        }

        info!("Installation access token obtained (expires {expires_at})");
        Ok(ScopedAccessCredential::new(token_response.token, expires_at))
    }
}

#[async_trait]
impl JitTokenRequester for GitHubClient {
    async fn request_jit_token(
        &self,
        credential: &ScopedAccessCredential,
        spec: &RunnerSpec,
    ) -> Result<RunnerRegistrationToken> {
        let url = format!("{}{}", self.api_url, spec.scope.jit_config_path());
        let body = JitConfigRequest {
            name: &spec.name,
            runner_group_id: spec.runner_group_id,
            labels: &spec.labels,
        };

        debug!(
            "Requesting JIT config for runner '{}' ({})",
            spec.name, spec.scope
        );

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", credential.bearer()))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let meta = response_meta(&response);
            let body = read_body(response).await;
            let err = classify_error(ApiStage::JitConfig, &meta, &body);
            return Err(match err {
                Error::RunnerNameConflict { detail, .. } => Error::RunnerNameConflict {
                    runner: spec.name.clone(),
                    detail,
                },
                other => other,
            });
        }

        let jit: JitConfigResponse = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("failed to parse JIT config response: {e}")))?;

        info!(
            "JIT runner config issued for '{}' (runner id {})",
            jit.runner.name, jit.runner.id
        );

        // GitHub does not echo an expiry for JIT configs; they are valid for
        // at most one hour from issuance.
        let expires_at = Utc::now() + Duration::hours(1);

        Ok(RunnerRegistrationToken::new(
            jit.encoded_jit_config,
            jit.runner.id,
            jit.runner.name,
            expires_at,
        ))
    }
}

/// Status and headers extracted from a response before its body is consumed.
struct ResponseMeta {
    status: StatusCode,
    retry_after: Option<std::time::Duration>,
}

fn response_meta(response: &Response) -> ResponseMeta {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs);
    ResponseMeta {
        status: response.status(),
        retry_after,
    }
}

async fn read_body(response: Response) -> String {
    response.text().await.unwrap_or_default()
}

/// Surface a successful response, or map a failed one onto the taxonomy.
async fn check_response(stage: ApiStage, response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let meta = response_meta(&response);
    let body = read_body(response).await;
    Err(classify_error(stage, &meta, &body))
}

/// Map an HTTP failure onto the error taxonomy.
///
/// Rate limits win over everything: GitHub signals secondary rate limits
/// with 403 + Retry-After as well as plain 429.
fn classify_error(stage: ApiStage, meta: &ResponseMeta, body: &str) -> Error {
    let status = meta.status;
    let detail = truncate_body(body);

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && meta.retry_after.is_some())
    {
        return Error::RateLimited {
            retry_after: meta.retry_after,
            detail,
        };
    }

    if status.is_server_error() {
        return Error::transport(format!("GitHub API error ({status}): {detail}"));
    }

    match (stage, status.as_u16()) {
        (ApiStage::Exchange, 400 | 401 | 403 | 404) => {
            Error::AuthenticationRejected {
                status: Some(status.as_u16()),
                detail,
            }
        }
        (ApiStage::JitConfig, 401) => Error::AuthenticationRejected {
            status: Some(401),
            detail,
        },
        (ApiStage::JitConfig, 403 | 404) => Error::ScopeInsufficient {
            status: status.as_u16(),
            detail,
        },
        (ApiStage::JitConfig, 409) => Error::RunnerNameConflict {
            runner: String::new(),
            detail,
        },
        (ApiStage::JitConfig, 422) if body.contains("already exists") => {
            Error::RunnerNameConflict {
                runner: String::new(),
                detail,
            }
        }
        _ => Error::transport(format!("unexpected GitHub API response ({status}): {detail}")),
    }
}

/// Keep operator-facing detail bounded; GitHub error bodies are small JSON
/// documents but proxies can return arbitrary HTML.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

/// Stub platform for dry runs: no key, no network, fake token.
///
/// Lets the rest of the provisioning flow (delivery, supervisor wiring) be
/// exercised without touching GitHub.
pub struct DryRunPlatform;

#[async_trait]
impl TokenExchanger for DryRunPlatform {
    async fn exchange(&self, _assertion: &SignedAssertion) -> Result<ScopedAccessCredential> {
        info!("DRY-RUN: issuing fake installation access token");
        Ok(ScopedAccessCredential::new(
            format!("dry-run-access-{}", uuid::Uuid::new_v4()),
            Utc::now() + Duration::hours(1),
        ))
    }
}

#[async_trait]
impl JitTokenRequester for DryRunPlatform {
    async fn request_jit_token(
        &self,
        _credential: &ScopedAccessCredential,
        spec: &RunnerSpec,
    ) -> Result<RunnerRegistrationToken> {
        let fake = format!("dry-run-jit-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        info!(
            "DRY-RUN: issuing fake JIT config for runner '{}': {fake}",
            spec.name
        );
        Ok(RunnerRegistrationToken::new(
            fake,
            0,
            spec.name.clone(),
            Utc::now() + Duration::hours(1),
        ))
    }
}
