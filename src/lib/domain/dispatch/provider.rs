//! Email service client abstraction and the send request it accepts

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::mock;

use super::{errors::ProviderError, EmailAddress, EmailRequest};

/// A single recipient entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRecipient {
    /// The recipient's address
    pub address: EmailAddress,
}

/// The recipient lists of a send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRecipients {
    /// Primary recipients
    pub to: Vec<EmailRecipient>,

    /// Carbon-copy recipients, serialized as `[]` when there are none
    pub cc: Vec<EmailRecipient>,
}

/// The content of a send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailContent {
    /// Subject line
    pub subject: String,

    /// HTML body, serialized as `null` when absent
    pub html: Option<String>,

    /// Plain text body, serialized as `plainText`
    pub plain_text: Option<String>,
}

/// The body of an ACS `emails:send` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailPayload {
    /// Subject and bodies
    pub content: EmailContent,

    /// Recipient lists
    pub recipients: EmailRecipients,

    /// The configured sender
    pub sender_address: EmailAddress,
}

impl SendEmailPayload {
    /// Builds the send request for a validated email request
    pub fn new(request: &EmailRequest, sender: &EmailAddress) -> Self {
        let recipients = |addresses: &[EmailAddress]| -> Vec<EmailRecipient> {
            addresses
                .iter()
                .map(|address| EmailRecipient {
                    address: address.clone(),
                })
                .collect()
        };

        Self {
            content: EmailContent {
                subject: request.subject().to_string(),
                html: request.html_body().map(str::to_string),
                plain_text: request.plain_text_body().map(str::to_string),
            },
            recipients: EmailRecipients {
                to: recipients(request.to()),
                cc: recipients(request.cc()),
            },
            sender_address: sender.clone(),
        }
    }
}

/// A submitted send operation that can be polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    /// The operation id, as returned on submission
    pub id: String,

    /// The URL to poll for the operation status
    pub operation_location: String,

    /// How long the service asked us to wait before polling
    pub retry_after: Option<Duration>,
}

/// A long-running-operation style email service client
#[async_trait]
pub trait EmailClient: Send + Sync + 'static {
    /// Submits a send request and returns a handle to the operation.
    async fn begin_send(&self, payload: &SendEmailPayload)
        -> Result<OperationHandle, ProviderError>;

    /// Polls the operation until it reaches a terminal status and returns the
    /// final status document, e.g. `{"id": "...", "status": "Succeeded"}`.
    async fn wait_until_done(&self, operation: &OperationHandle) -> Result<Value, ProviderError>;
}

#[cfg(test)]
mock! {
    pub EmailClient {}

    #[async_trait]
    impl EmailClient for EmailClient {
        async fn begin_send(&self, payload: &SendEmailPayload) -> Result<OperationHandle, ProviderError>;
        async fn wait_until_done(&self, operation: &OperationHandle) -> Result<Value, ProviderError>;
    }
}

/// How to reach and authenticate with the email service
#[derive(Clone, PartialEq, Eq)]
pub enum AcsConnection {
    /// A connection string carrying the endpoint and a shared access key
    ConnectionString(String),

    /// An endpoint URL, authenticated with the ambient managed identity
    Endpoint(String),
}

impl AcsConnection {
    /// Picks the connection string when one is set, otherwise the endpoint.
    /// Blank values count as unset.
    pub fn select(connection_string: Option<&str>, endpoint: Option<&str>) -> Option<Self> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match (present(connection_string), present(endpoint)) {
            (Some(cs), _) => Some(AcsConnection::ConnectionString(cs)),
            (None, Some(endpoint)) => Some(AcsConnection::Endpoint(endpoint)),
            (None, None) => None,
        }
    }
}

impl fmt::Debug for AcsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcsConnection::ConnectionString(_) => f.write_str("ConnectionString(<redacted>)"),
            AcsConnection::Endpoint(endpoint) => f.debug_tuple("Endpoint").field(endpoint).finish(),
        }
    }
}

/// Builds email clients for each supported authentication method
pub trait EmailClientFactory {
    /// The client type produced
    type Client: EmailClient;

    /// Builds a client authenticated by a connection string's access key
    fn from_connection_string(&self, connection_string: &str)
        -> Result<Self::Client, ProviderError>;

    /// Builds a client for `endpoint` authenticated by the managed identity
    fn from_endpoint(&self, endpoint: &str) -> Result<Self::Client, ProviderError>;
}

#[cfg(test)]
mock! {
    pub EmailClientFactory {}

    impl EmailClientFactory for EmailClientFactory {
        type Client = MockEmailClient;

        fn from_connection_string(&self, connection_string: &str) -> Result<MockEmailClient, ProviderError>;
        fn from_endpoint(&self, endpoint: &str) -> Result<MockEmailClient, ProviderError>;
    }
}

/// Creates the email client for `connection`, using exactly one construction path.
pub fn connect<F>(factory: &F, connection: &AcsConnection) -> Result<F::Client, ProviderError>
where
    F: EmailClientFactory,
{
    match connection {
        AcsConnection::ConnectionString(connection_string) => {
            debug!("Using ACS connection string");
            factory.from_connection_string(connection_string)
        }
        AcsConnection::Endpoint(endpoint) => {
            debug!(%endpoint, "Using ACS endpoint and managed identity");
            factory.from_endpoint(endpoint)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_payload_maps_every_field() -> TestResult {
        let request = EmailRequest::validate(&json!({
            "to": ["recipient@example.com"],
            "subject": "Test Subject",
            "html": "<h1>Test HTML</h1>",
            "plaintext": "Test Plaintext",
            "cc": ["cc.recipient@example.com"]
        }))?;
        let sender = EmailAddress::new("sender@example.com")?;

        let payload = serde_json::to_value(SendEmailPayload::new(&request, &sender))?;

        assert_eq!(
            payload,
            json!({
                "content": {
                    "subject": "Test Subject",
                    "html": "<h1>Test HTML</h1>",
                    "plainText": "Test Plaintext"
                },
                "recipients": {
                    "to": [{"address": "recipient@example.com"}],
                    "cc": [{"address": "cc.recipient@example.com"}]
                },
                "senderAddress": "sender@example.com"
            })
        );

        Ok(())
    }

    #[test]
    fn test_payload_for_minimal_request() -> TestResult {
        let request = EmailRequest::validate(&json!({"to": ["a@x.com"], "subject": "Hi"}))?;
        let sender = EmailAddress::new("sender@example.com")?;

        let payload = serde_json::to_value(SendEmailPayload::new(&request, &sender))?;

        assert_eq!(payload["content"]["html"], Value::Null);
        assert_eq!(payload["content"]["plainText"], Value::Null);
        assert_eq!(payload["recipients"]["cc"], json!([]));
        assert_eq!(payload["recipients"]["to"], json!([{"address": "a@x.com"}]));

        Ok(())
    }

    #[test]
    fn test_select_prefers_connection_string() {
        assert_eq!(
            AcsConnection::select(Some("endpoint=x;accesskey=y"), Some("https://acs.example.com")),
            Some(AcsConnection::ConnectionString("endpoint=x;accesskey=y".to_string()))
        );
        assert_eq!(
            AcsConnection::select(Some("  "), Some("https://acs.example.com")),
            Some(AcsConnection::Endpoint("https://acs.example.com".to_string()))
        );
        assert_eq!(AcsConnection::select(None, Some("")), None);
    }

    #[test]
    fn test_connection_string_is_redacted() {
        let connection = AcsConnection::ConnectionString("endpoint=x;accesskey=secret".to_string());

        assert!(!format!("{connection:?}").contains("secret"));
    }

    #[test]
    fn test_connect_with_connection_string() -> TestResult {
        let mut factory = MockEmailClientFactory::new();

        factory
            .expect_from_connection_string()
            .withf(|connection_string| connection_string == "test_connection_string")
            .times(1)
            .returning(|_| Ok(MockEmailClient::new()));
        factory.expect_from_endpoint().times(0);

        connect(
            &factory,
            &AcsConnection::ConnectionString("test_connection_string".to_string()),
        )?;

        Ok(())
    }

    #[test]
    fn test_connect_with_endpoint() -> TestResult {
        let mut factory = MockEmailClientFactory::new();

        factory.expect_from_connection_string().times(0);
        factory
            .expect_from_endpoint()
            .withf(|endpoint| endpoint == "https://acs.example.com")
            .times(1)
            .returning(|_| Ok(MockEmailClient::new()));

        connect(
            &factory,
            &AcsConnection::Endpoint("https://acs.example.com".to_string()),
        )?;

        Ok(())
    }
}
