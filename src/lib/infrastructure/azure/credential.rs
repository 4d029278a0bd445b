//! Managed identity token credential

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::mock;

use crate::infrastructure::config::IdentityConfig;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Tokens expiring sooner than this are refreshed
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Errors raised while acquiring a token
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The identity endpoint answered with an error
    #[error("identity endpoint returned HTTP {status}: {message}")]
    Http {
        /// The HTTP status code
        status: u16,

        /// The response body
        message: String,
    },

    /// The identity endpoint answered with something unexpected
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// Network or transport failure
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// A bearer token
#[derive(Clone)]
pub struct AccessToken {
    /// The token value
    pub token: String,

    /// When the token expires, if known
    pub expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_on
            .is_some_and(|expires| expires - Duration::minutes(REFRESH_MARGIN_MINUTES) > Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// A source of bearer tokens for Azure services
#[async_trait]
pub trait TokenCredential: fmt::Debug + Send + Sync + 'static {
    /// Returns a token for `scope`, e.g. `https://storage.azure.com/.default`
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

#[cfg(test)]
mock! {
    pub TokenCredential {}

    #[async_trait]
    impl TokenCredential for TokenCredential {
        async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
    }
}

#[cfg(test)]
impl fmt::Debug for MockTokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MockTokenCredential")
    }
}

#[derive(Debug, Clone)]
enum IdentitySource {
    AppService { endpoint: Url, header: String },
    Imds { endpoint: Url },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
}

/// Token credential backed by the platform's managed identity.
///
/// Uses the App Service identity endpoint when `IDENTITY_ENDPOINT` and
/// `IDENTITY_HEADER` are both set, and the instance metadata service otherwise.
/// Tokens are cached per resource until shortly before they expire.
#[derive(Debug)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: IdentitySource,
    client_id: Option<String>,
    cache: RwLock<HashMap<String, AccessToken>>,
}

impl ManagedIdentityCredential {
    /// Creates a credential from the identity settings
    pub fn new(http: reqwest::Client, config: &IdentityConfig) -> Result<Self, url::ParseError> {
        let source = match (&config.identity_endpoint, &config.identity_header) {
            (Some(endpoint), Some(header)) => IdentitySource::AppService {
                endpoint: Url::parse(endpoint)?,
                header: header.clone(),
            },
            _ => IdentitySource::Imds {
                endpoint: Url::parse(IMDS_ENDPOINT)?,
            },
        };

        Ok(Self::with_source(http, source, config.client_id.clone()))
    }

    fn with_source(http: reqwest::Client, source: IdentitySource, client_id: Option<String>) -> Self {
        Self {
            http,
            source,
            client_id,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let (mut url, api_version) = match &self.source {
            IdentitySource::AppService { endpoint, .. } => (endpoint.clone(), APP_SERVICE_API_VERSION),
            IdentitySource::Imds { endpoint } => (endpoint.clone(), IMDS_API_VERSION),
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", api_version);
            query.append_pair("resource", resource);
            if let Some(client_id) = &self.client_id {
                query.append_pair("client_id", client_id);
            }
        }

        let request = match &self.source {
            IdentitySource::AppService { header, .. } => {
                self.http.get(url).header("X-IDENTITY-HEADER", header)
            }
            IdentitySource::Imds { .. } => self.http.get(url).header("Metadata", "true"),
        };

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(CredentialError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| CredentialError::InvalidResponse(err.to_string()))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_on: body.expires_on.as_ref().and_then(parse_expires_on),
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope.trim_end_matches("/.default").to_string();

        if let Some(token) = self.cache.read().await.get(&resource) {
            if token.is_fresh() {
                return Ok(token.clone());
            }
        }

        debug!(%resource, "Requesting managed identity token");

        let token = self.fetch(&resource).await?;
        self.cache.write().await.insert(resource, token.clone());

        Ok(token)
    }
}

/// `expires_on` is seconds since the epoch, sent as a string or a number
fn parse_expires_on(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };

    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn expires_in_an_hour() -> String {
        (Utc::now().timestamp() + 3600).to_string()
    }

    #[tokio::test]
    async fn test_app_service_token() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/msi/token"))
            .and(header("X-IDENTITY-HEADER", "identity-secret"))
            .and(query_param("api-version", APP_SERVICE_API_VERSION))
            .and(query_param("resource", "https://communication.azure.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-service-token",
                "expires_on": expires_in_an_hour(),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credential = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            &IdentityConfig {
                identity_endpoint: Some(format!("{}/msi/token", server.uri())),
                identity_header: Some("identity-secret".to_string()),
                client_id: None,
            },
        )?;

        let token = credential
            .get_token("https://communication.azure.com/.default")
            .await?;
        assert_eq!(token.token, "app-service-token");

        // Served from the cache; the mock expects a single call.
        let token = credential
            .get_token("https://communication.azure.com/.default")
            .await?;
        assert_eq!(token.token, "app-service-token");

        Ok(())
    }

    #[tokio::test]
    async fn test_imds_token_with_client_id() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .and(query_param("api-version", IMDS_API_VERSION))
            .and(query_param("resource", "https://storage.azure.com"))
            .and(query_param("client_id", "user-assigned"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "imds-token",
                "expires_on": Utc::now().timestamp() + 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credential = ManagedIdentityCredential::with_source(
            reqwest::Client::new(),
            IdentitySource::Imds {
                endpoint: Url::parse(&format!("{}/metadata/identity/oauth2/token", server.uri()))?,
            },
            Some("user-assigned".to_string()),
        );

        let token = credential.get_token("https://storage.azure.com/.default").await?;

        assert_eq!(token.token, "imds-token");
        assert!(token.expires_on.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_identity_endpoint_error() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("no identity assigned"))
            .mount(&server)
            .await;

        let credential = ManagedIdentityCredential::with_source(
            reqwest::Client::new(),
            IdentitySource::Imds {
                endpoint: Url::parse(&server.uri())?,
            },
            None,
        );

        let err = credential
            .get_token("https://storage.azure.com/.default")
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::Http { status: 400, ref message } if message == "no identity assigned"));

        Ok(())
    }

    #[test]
    fn test_parse_expires_on() {
        let expected = Utc.timestamp_opt(1586984735, 0).single();

        assert_eq!(parse_expires_on(&json!("1586984735")), expected);
        assert_eq!(parse_expires_on(&json!(1586984735)), expected);
        assert_eq!(parse_expires_on(&json!("soon")), None);
    }
}
