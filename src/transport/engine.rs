//! Transport engine
//!
//! A [`Provider`] holds everything shared by all accounts of one marketplace
//! API: base URL, retry policy, auth scheme, HTTP client and the in-flight
//! request limiter. A [`Transport`] binds a provider to one [`ClientContext`]
//! for the lifetime of a sync unit.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};

use super::auth::AuthScheme;
use super::client::{ClientError, HttpClient, HttpRequest, HttpResponse, ReqwestClient};
use super::policy::RetryPolicy;
use crate::error::{Result, SyncError, TransportError};
use crate::sync::ClientContext;

/// Provider settings as they appear in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub auth: AuthScheme,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Upper bound on concurrent outstanding requests to this provider
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    60
}

/// Shared, immutable provider engine
pub struct Provider {
    name: String,
    base_url: String,
    auth: AuthScheme,
    policy: RetryPolicy,
    http: Arc<dyn HttpClient>,
    limiter: Semaphore,
}

impl Provider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        auth: AuthScheme,
        policy: RetryPolicy,
        http: Arc<dyn HttpClient>,
        max_in_flight: usize,
    ) -> Result<Self> {
        policy.validate()?;
        if max_in_flight == 0 {
            return Err(SyncError::Config(
                "provider max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            policy,
            http,
            limiter: Semaphore::new(max_in_flight),
        })
    }

    /// Build a provider backed by reqwest from its catalog entry
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let http = ReqwestClient::new(Duration::from_secs(config.timeout_secs))
            .map_err(|e| SyncError::Config(format!("http client for {}: {}", config.name, e)))?;
        Self::new(
            config.name.clone(),
            config.base_url.clone(),
            config.auth.clone(),
            config.retry.clone(),
            Arc::new(http),
            config.max_in_flight,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bind this provider to one client account
    pub fn session(self: &Arc<Self>, client: ClientContext) -> Transport {
        Transport {
            provider: Arc::clone(self),
            client,
            token: OnceCell::new(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// A relative provider request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Whether the endpoint tolerates repeated delivery
    pub idempotent: bool,
}

impl Request {
    /// GET requests are safe to retry
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
            idempotent: true,
        }
    }

    /// POST requests are not retried unless marked [`Request::idempotent`]
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: None,
            idempotent: false,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Mark a POST endpoint as a read that may be retried
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

enum Failure {
    Status(HttpResponse),
    Client(ClientError),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Status(resp) => format!("status {}", resp.status),
            Failure::Client(err) => err.to_string(),
        }
    }

    fn into_error(self) -> SyncError {
        match self {
            Failure::Status(resp) => TransportError::Status {
                status: resp.status,
                body: resp.body_snippet(),
            }
            .into(),
            Failure::Client(err) => TransportError::Connection(err.to_string()).into(),
        }
    }
}

/// Provider engine bound to one client
pub struct Transport {
    provider: Arc<Provider>,
    client: ClientContext,
    token: OnceCell<String>,
}

impl Transport {
    pub fn client(&self) -> &ClientContext {
        &self.client
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Perform a JSON call under the provider's retry policy.
    ///
    /// Non-idempotent requests get exactly one attempt.
    #[tracing::instrument(level = "debug", skip(self, request), fields(provider = %self.provider.name, client = %self.client.client_id, path = %request.path))]
    pub async fn call(&self, request: &Request) -> Result<serde_json::Value> {
        let http_request = self.build(request).await?;
        let response = self.send(http_request, request.idempotent).await?;
        parse_json(&response)
    }

    /// Perform a JSON call with a single attempt regardless of idempotency
    pub async fn call_once(&self, request: &Request) -> Result<serde_json::Value> {
        let http_request = self.build(request).await?;
        let response = self.send(http_request, false).await?;
        parse_json(&response)
    }

    /// Download raw bytes with exactly one attempt
    pub async fn download(&self, location: &str, authenticated: bool) -> Result<Vec<u8>> {
        let mut http_request = HttpRequest::new(Method::GET, self.provider.url_for(location));
        if authenticated {
            http_request.headers = self.auth_headers().await?;
        }
        let response = self.send(http_request, false).await?;
        Ok(response.body)
    }

    async fn build(&self, request: &Request) -> Result<HttpRequest> {
        let mut http_request =
            HttpRequest::new(request.method.clone(), self.provider.url_for(&request.path));
        http_request.headers = self.auth_headers().await?;
        http_request.query = request.query.clone();
        http_request.body = request.body.clone();
        Ok(http_request)
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>> {
        if let Some(headers) = self.provider.auth.static_headers(&self.client)? {
            return Ok(headers);
        }
        let AuthScheme::TokenExchange(exchange) = &self.provider.auth else {
            return Ok(Vec::new());
        };

        let token = self
            .token
            .get_or_try_init(|| async {
                let mut http_request =
                    HttpRequest::new(Method::POST, self.provider.url_for(&exchange.path));
                http_request.body = Some(exchange.request_body(&self.client)?);
                let response = self.send(http_request, true).await?;
                let token = exchange.extract_token(&parse_json(&response)?)?;
                tracing::info!(
                    provider = %self.provider.name,
                    client = %self.client.client_id,
                    "Obtained provider access token"
                );
                Ok::<_, SyncError>(token)
            })
            .await?;

        Ok(vec![exchange.header_for(token)])
    }

    async fn send(&self, request: HttpRequest, retry: bool) -> Result<HttpResponse> {
        let policy = &self.provider.policy;
        let max_attempts = if retry { policy.max_attempts } else { 1 };
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = {
                let _permit = self.provider.limiter.acquire().await.map_err(|_| {
                    SyncError::Transport(TransportError::Connection(
                        "provider limiter closed".to_string(),
                    ))
                })?;
                self.provider.http.execute(request.clone()).await
            };

            let failure = match outcome {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if response.status == 401 || response.status == 403 => {
                    return Err(SyncError::Auth {
                        status: response.status,
                        message: response.body_snippet(),
                    });
                }
                Ok(response) if policy.is_retryable_status(response.status) => {
                    Failure::Status(response)
                }
                Ok(response) => return Err(Failure::Status(response).into_error()),
                Err(err) if policy.is_retryable_error(err.kind) => Failure::Client(err),
                Err(err) => return Err(Failure::Client(err).into_error()),
            };

            if !retry {
                return Err(failure.into_error());
            }

            if attempt >= max_attempts {
                tracing::error!(
                    provider = %self.provider.name,
                    url = %request.url,
                    attempts = attempt,
                    failure = %failure.describe(),
                    "Provider request failed, retry budget exhausted"
                );
                return Err(TransportError::AttemptsExhausted {
                    attempts: attempt,
                    last: failure.describe(),
                }
                .into());
            }

            let delay = policy.delay_after(attempt);
            tracing::warn!(
                provider = %self.provider.name,
                url = %request.url,
                attempt,
                max_attempts,
                failure = %failure.describe(),
                delay_ms = delay.as_millis() as u64,
                "Retrying provider request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn parse_json(response: &HttpResponse) -> Result<serde_json::Value> {
    if response.body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| TransportError::MalformedBody(e.to_string()).into())
}
