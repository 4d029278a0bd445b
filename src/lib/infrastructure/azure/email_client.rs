//! Azure Communication Services email REST client

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER},
    Method, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{http_date, AcsConnectionString, TokenCredential};
use crate::{
    domain::dispatch::{
        errors::ProviderError, EmailClient, EmailClientFactory, OperationHandle, SendEmailPayload,
    },
    infrastructure::config::PollingConfig,
};

const API_VERSION: &str = "2023-03-31";
const COMMUNICATION_SCOPE: &str = "https://communication.azure.com/.default";
const OPERATION_LOCATION: &str = "operation-location";
const RETRY_AFTER_MS: &str = "retry-after-ms";
const TERMINAL_STATUSES: [&str; 3] = ["succeeded", "failed", "canceled"];

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.into())
    }
}

#[derive(Debug)]
enum Auth {
    AccessKey(AcsConnectionString),
    Token(Arc<dyn TokenCredential>),
}

enum Poll {
    Done(Value),
    Running {
        status: Option<String>,
        retry_after: Option<Duration>,
    },
    Transient {
        error: ProviderError,
        retry_after: Option<Duration>,
    },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Talks to the `emails:send` long-running operation.
///
/// Submitting returns as soon as the service accepts the request (`202`);
/// [`EmailClient::wait_until_done`] then polls the `Operation-Location` until
/// the operation succeeds, fails or is canceled.
#[derive(Debug)]
pub struct AcsEmailClient {
    http: reqwest::Client,
    endpoint: Url,
    auth: Auth,
    polling: PollingConfig,
}

impl AcsEmailClient {
    /// A client that signs requests with the connection string's access key
    pub fn with_access_key(
        http: reqwest::Client,
        connection_string: AcsConnectionString,
        polling: PollingConfig,
    ) -> Self {
        Self {
            http,
            endpoint: connection_string.endpoint().clone(),
            auth: Auth::AccessKey(connection_string),
            polling,
        }
    }

    /// A client that authenticates with bearer tokens from `credential`
    pub fn with_credential(
        http: reqwest::Client,
        endpoint: Url,
        credential: Arc<dyn TokenCredential>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            http,
            endpoint,
            auth: Auth::Token(credential),
            polling,
        }
    }

    fn send_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let path = format!("{}/emails:send", url.path().trim_end_matches('/'));

        url.set_path(&path);
        url.set_query(None);
        url.query_pairs_mut().append_pair("api-version", API_VERSION);

        url
    }

    async fn authorize(
        &self,
        request: RequestBuilder,
        method: &Method,
        url: &Url,
        body: &[u8],
    ) -> Result<RequestBuilder, ProviderError> {
        match &self.auth {
            Auth::AccessKey(key) => {
                let signed = key.sign(method.as_str(), url, body, Utc::now());

                Ok(request
                    .header("x-ms-date", signed.date)
                    .header("x-ms-content-sha256", signed.content_hash)
                    .header(AUTHORIZATION, signed.authorization))
            }
            Auth::Token(credential) => {
                let token = credential
                    .get_token(COMMUNICATION_SCOPE)
                    .await
                    .map_err(|err| ProviderError::Authentication(err.into()))?;

                Ok(request.bearer_auth(token.token))
            }
        }
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        method: Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<Response, ProviderError> {
        let request = self.authorize(request, &method, &url, &body).await?;
        let request = if body.is_empty() {
            request
        } else {
            request.header(CONTENT_TYPE, "application/json").body(body)
        };

        let response = request.send().await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(http_error(response).await)
        }
    }

    /// One status poll. Timeouts, throttling, server errors and transport
    /// failures leave the operation running, so they are reported as
    /// [`Poll::Transient`] rather than as errors.
    async fn poll(&self, url: &Url) -> Result<Poll, ProviderError> {
        let request = self
            .authorize(self.http.get(url.clone()), &Method::GET, url, &[])
            .await?;

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Ok(Poll::Transient {
                    error: err.into(),
                    retry_after: None,
                })
            }
        };

        let retry_after = retry_after(response.headers());
        let status = response.status();

        if is_transient(status) {
            return Ok(Poll::Transient {
                error: http_error(response).await,
                retry_after,
            });
        }

        if !status.is_success() {
            return Err(http_error(response).await);
        }

        let result: Value = response.json().await?;

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);

        if status.as_deref().is_some_and(is_terminal) {
            return Ok(Poll::Done(result));
        }

        Ok(Poll::Running {
            status,
            retry_after,
        })
    }
}

#[async_trait]
impl EmailClient for AcsEmailClient {
    async fn begin_send(
        &self,
        payload: &SendEmailPayload,
    ) -> Result<OperationHandle, ProviderError> {
        let url = self.send_url();
        let body = serde_json::to_vec(payload).map_err(|err| {
            ProviderError::Configuration(format!("could not serialize the send request: {err}"))
        })?;
        let request_id = Uuid::now_v7();

        debug!(%request_id, %url, "Submitting send request");

        let request = self
            .http
            .request(Method::POST, url.clone())
            .header("repeatability-request-id", request_id.to_string())
            .header("repeatability-first-sent", http_date(Utc::now()));

        let response = self.execute(request, Method::POST, url, body).await?;

        if response.status() != StatusCode::ACCEPTED {
            warn!(status = %response.status(), "Send request accepted with an unexpected status");
        }

        let operation_location = header_value(response.headers(), OPERATION_LOCATION)
            .map(str::to_string)
            .ok_or(ProviderError::MissingOperationLocation)?;
        let retry_after = retry_after(response.headers());

        let body: Option<Value> = response.json().await.ok();
        let id = body
            .as_ref()
            .and_then(|b| b.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| operation_id(&operation_location))
            .unwrap_or_else(|| request_id.to_string());

        Ok(OperationHandle {
            id,
            operation_location,
            retry_after,
        })
    }

    async fn wait_until_done(&self, operation: &OperationHandle) -> Result<Value, ProviderError> {
        let url = self
            .endpoint
            .join(&operation.operation_location)
            .map_err(|err| {
                ProviderError::Transport(anyhow::anyhow!(
                    "invalid Operation-Location '{}': {err}",
                    operation.operation_location
                ))
            })?;

        let deadline = Instant::now() + self.polling.timeout;
        let mut delay = operation.retry_after.unwrap_or(self.polling.interval);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(delay.min(remaining)).await;

            let next_delay = match self.poll(&url).await? {
                Poll::Done(result) => return Ok(result),
                Poll::Running {
                    status,
                    retry_after,
                } => {
                    debug!(operation_id = %operation.id, ?status, "Send operation still running");
                    retry_after
                }
                Poll::Transient { error, retry_after } => {
                    warn!(
                        operation_id = %operation.id,
                        error = %error,
                        "Polling the send operation failed, retrying"
                    );
                    retry_after
                }
            };

            if Instant::now() >= deadline {
                return Err(ProviderError::PollTimeout {
                    operation_id: operation.id.clone(),
                });
            }

            delay = next_delay.unwrap_or(self.polling.interval);
        }
    }
}

/// Builds [`AcsEmailClient`]s sharing one HTTP client and credential
#[derive(Debug, Clone)]
pub struct AcsClientFactory {
    http: reqwest::Client,
    polling: PollingConfig,
    credential: Arc<dyn TokenCredential>,
}

impl AcsClientFactory {
    /// Creates a new factory
    pub fn new(
        http: reqwest::Client,
        polling: PollingConfig,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http,
            polling,
            credential,
        }
    }
}

impl EmailClientFactory for AcsClientFactory {
    type Client = AcsEmailClient;

    fn from_connection_string(
        &self,
        connection_string: &str,
    ) -> Result<Self::Client, ProviderError> {
        Ok(AcsEmailClient::with_access_key(
            self.http.clone(),
            connection_string.parse()?,
            self.polling,
        ))
    }

    fn from_endpoint(&self, endpoint: &str) -> Result<Self::Client, ProviderError> {
        let endpoint = Url::parse(endpoint).map_err(|err| {
            ProviderError::Configuration(format!("invalid ACS endpoint '{endpoint}': {err}"))
        })?;

        Ok(AcsEmailClient::with_credential(
            self.http.clone(),
            endpoint,
            Arc::clone(&self.credential),
            self.polling,
        ))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn is_terminal(status: &str) -> bool {
    TERMINAL_STATUSES
        .iter()
        .any(|terminal| terminal.eq_ignore_ascii_case(status))
}

/// `retry-after-ms` wins over `Retry-After`; only delays in seconds are understood
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let millis = header_value(headers, RETRY_AFTER_MS)
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_millis);

    millis.or_else(|| {
        header_value(headers, RETRY_AFTER.as_str())
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_secs)
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `.../emails/operations/{id}?api-version=...`
fn operation_id(operation_location: &str) -> Option<String> {
    let url = Url::parse(operation_location).ok()?;
    let id = url.path_segments()?.last()?.to_string();

    (!id.is_empty()).then_some(id)
}

async fn http_error(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ProviderError::Http {
            status,
            code: body.error.code,
            message: body.error.message.unwrap_or(text),
        },
        Err(_) => ProviderError::Http {
            status,
            code: None,
            message: text,
        },
    }
}
