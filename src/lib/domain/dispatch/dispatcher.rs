//! Email dispatcher

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::mock;

use super::{
    errors::EmailDispatchError, EmailAddress, EmailClient, EmailRequest, SendEmailPayload,
    SendOutcome,
};

/// Sends validated email requests
#[async_trait]
pub trait EmailDispatcher: Send + Sync + 'static {
    /// Sends an email and waits for the provider to report a terminal status.
    ///
    /// # Arguments
    /// * `request` - The validated [`EmailRequest`] to send.
    ///
    /// # Returns
    /// - [`Ok`] with the [`SendOutcome`] if the provider reported success.
    /// - [`Err`] with an [`EmailDispatchError`] on any client error or any
    ///   other terminal status.
    async fn send(&self, request: &EmailRequest) -> Result<SendOutcome, EmailDispatchError>;
}

#[cfg(test)]
mock! {
    pub EmailDispatcher {}

    #[async_trait]
    impl EmailDispatcher for EmailDispatcher {
        async fn send(&self, request: &EmailRequest) -> Result<SendOutcome, EmailDispatchError>;
    }
}

/// Dispatcher for Azure Communication Services
#[derive(Debug, Clone)]
pub struct AcsEmailDispatcher<C>
where
    C: EmailClient,
{
    client: Arc<C>,
    sender: EmailAddress,
}

impl<C> AcsEmailDispatcher<C>
where
    C: EmailClient,
{
    /// Creates a dispatcher sending from `sender` through `client`
    pub fn new(client: Arc<C>, sender: EmailAddress) -> Self {
        Self { client, sender }
    }
}

#[async_trait]
impl<C> EmailDispatcher for AcsEmailDispatcher<C>
where
    C: EmailClient,
{
    async fn send(&self, request: &EmailRequest) -> Result<SendOutcome, EmailDispatchError> {
        let payload = SendEmailPayload::new(request, &self.sender);
        debug!(?payload, "Built ACS send request");

        info!("Sending email...");
        let result = match self.client.begin_send(&payload).await {
            Ok(operation) => self.client.wait_until_done(&operation).await,
            Err(err) => Err(err),
        };

        let result = result.map_err(|err| {
            error!(error = %err, "Azure SDK error sending email via ACS");
            EmailDispatchError::from(err)
        })?;

        debug!(%result, "ACS send poller finished");

        let outcome = SendOutcome::from_result(&result);

        if outcome.is_success() {
            info!(
                recipients = ?request.to(),
                message_id = outcome.provider_message_id.as_deref(),
                "Successfully sent email via ACS"
            );

            return Ok(outcome);
        }

        let status = outcome
            .raw_status
            .clone()
            .unwrap_or_else(|| outcome.status.to_string());

        error!(
            %status,
            message_id = outcome.provider_message_id.as_deref(),
            error_details = ?outcome.error_detail,
            "ACS email send finished without success"
        );

        Err(EmailDispatchError::Unsuccessful {
            status,
            message_id: outcome.provider_message_id,
            detail: outcome.error_detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use testresult::TestResult;

    use crate::domain::dispatch::{
        errors::ProviderError, tests::MockEmailClient, OperationHandle, SendStatus,
    };

    use super::*;

    fn email_request() -> EmailRequest {
        EmailRequest::validate(&json!({
            "to": ["recipient@example.com"],
            "subject": "Test Subject",
            "html": "<h1>Test HTML</h1>",
            "plaintext": "Test Plaintext",
            "cc": ["cc.recipient@example.com"]
        }))
        .unwrap()
    }

    fn operation() -> OperationHandle {
        OperationHandle {
            id: "test-message-id".to_string(),
            operation_location: "https://acs.example.com/emails/operations/test-message-id"
                .to_string(),
            retry_after: None,
        }
    }

    fn dispatcher(client: MockEmailClient) -> AcsEmailDispatcher<MockEmailClient> {
        AcsEmailDispatcher::new(
            Arc::new(client),
            EmailAddress::new("sender@example.com").unwrap(),
        )
    }

    fn client_returning(result: Value) -> MockEmailClient {
        let mut client = MockEmailClient::new();

        client
            .expect_begin_send()
            .times(1)
            .returning(|_| Ok(operation()));
        client
            .expect_wait_until_done()
            .times(1)
            .returning(move |_| Ok(result.clone()));

        client
    }

    #[tokio::test]
    async fn test_send_email_success() -> TestResult {
        let mut client = MockEmailClient::new();

        client
            .expect_begin_send()
            .times(1)
            .withf(|payload| {
                serde_json::to_value(payload).unwrap()
                    == json!({
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
            })
            .returning(|_| Ok(operation()));
        client
            .expect_wait_until_done()
            .times(1)
            .withf(|op| *op == operation())
            .returning(|_| Ok(json!({"status": "Succeeded", "id": "test-message-id"})));

        let outcome = dispatcher(client).send(&email_request()).await?;

        assert_eq!(outcome.status, SendStatus::Succeeded);
        assert_eq!(outcome.provider_message_id.as_deref(), Some("test-message-id"));

        Ok(())
    }

    #[tokio::test]
    async fn test_status_comparison_ignores_case() -> TestResult {
        let client = client_returning(json!({"status": "succeeded", "id": "lower"}));

        dispatcher(client).send(&email_request()).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_send_email_failure_status() {
        let client = client_returning(
            json!({"status": "Failed", "id": "failed-id", "error": "Invalid recipient"}),
        );

        let err = dispatcher(client).send(&email_request()).await.unwrap_err();

        assert!(err
            .to_string()
            .contains("ACS email send failed with status: Failed"));

        match err {
            EmailDispatchError::Unsuccessful {
                status,
                message_id,
                detail,
            } => {
                assert_eq!(status, "Failed");
                assert_eq!(message_id.as_deref(), Some("failed-id"));
                assert_eq!(detail, Some(json!("Invalid recipient")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrecognised_status_is_a_failure() {
        let client = client_returning(json!({"status": "Canceled", "id": "canceled-id"}));

        let err = dispatcher(client).send(&email_request()).await.unwrap_err();

        assert!(err.to_string().contains("Canceled"));
    }

    #[tokio::test]
    async fn test_missing_status_is_a_failure() {
        let client = client_returning(json!({"id": "no-status"}));

        let err = dispatcher(client).send(&email_request()).await.unwrap_err();

        assert!(matches!(
            err,
            EmailDispatchError::Unsuccessful { ref status, .. } if status == "<absent>"
        ));
    }

    #[tokio::test]
    async fn test_provider_error_on_submission_propagates() {
        let mut client = MockEmailClient::new();

        client
            .expect_begin_send()
            .times(1)
            .returning(|_| Err(ProviderError::Transport(anyhow!("SDK network error"))));
        client.expect_wait_until_done().times(0);

        let err = dispatcher(client).send(&email_request()).await.unwrap_err();

        assert!(matches!(
            err,
            EmailDispatchError::Provider(ProviderError::Transport(_))
        ));
        assert_eq!(err.to_string(), "could not reach the email service: SDK network error");
    }

    #[tokio::test]
    async fn test_provider_error_while_polling_propagates() {
        let mut client = MockEmailClient::new();

        client
            .expect_begin_send()
            .times(1)
            .returning(|_| Ok(operation()));
        client.expect_wait_until_done().times(1).returning(|op| {
            Err(ProviderError::PollTimeout {
                operation_id: op.id.clone(),
            })
        });

        let err = dispatcher(client).send(&email_request()).await.unwrap_err();

        assert!(matches!(
            err,
            EmailDispatchError::Provider(ProviderError::PollTimeout { .. })
        ));
    }
}
