//! Error types for decoding, validating and dispatching email requests

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::EmailAddressError;

/// The reason a single payload field was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationReason {
    /// The field is required but absent or null
    #[error("required field missing")]
    Missing,

    /// The payload itself is not a JSON object
    #[error("expected an object")]
    ExpectedObject,

    /// The field must be a string
    #[error("expected a string")]
    ExpectedString,

    /// The field must be a list of strings
    #[error("expected list of strings")]
    ExpectedStringList,

    /// The field is a string but empty
    #[error("must not be empty")]
    Empty,

    /// The recipient list is empty
    #[error("at least one recipient is required")]
    NoRecipients,

    /// The field is not a valid email address
    #[error("invalid email address: {0}")]
    InvalidAddress(#[from] EmailAddressError),
}

/// A rejected payload field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// The path of the field, e.g. `subject` or `to[1]`
    pub field: String,

    /// Why the field was rejected
    pub reason: ViolationReason,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Every violation found while validating an email request payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub(crate) fn new(violations: Vec<FieldViolation>) -> Self {
        Self { violations }
    }

    /// The individual field violations, in payload order
    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Returns true if `field` was rejected
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.violations.len();
        write!(
            f,
            "{} validation error{}: ",
            count,
            if count == 1 { "" } else { "s" }
        )?;

        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }

        Ok(())
    }
}

/// Errors raised while fetching a referenced blob
#[derive(Debug, Error)]
pub enum BlobReadError {
    /// The blob does not exist
    #[error("blob '{blob_name}' not found")]
    NotFound {
        /// The requested blob
        blob_name: String,
    },

    /// Storage answered with an unexpected status
    #[error("storage returned HTTP {status}: {message}")]
    Http {
        /// The HTTP status code
        status: u16,

        /// The response body, if any
        message: String,
    },

    /// No token could be obtained for storage
    #[error("could not authenticate with storage")]
    Authentication(#[source] anyhow::Error),

    /// Network or transport failure
    #[error(transparent)]
    Transport(anyhow::Error),
}

/// Errors raised while turning a trigger event into a JSON payload
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The event or blob content is not valid JSON
    #[error("invalid JSON in {origin}: {error}")]
    InvalidJson {
        /// Where the content came from
        origin: String,

        /// The parser error
        #[source]
        error: serde_json::Error,
    },

    /// The envelope references a blob but the reference is unusable
    #[error("invalid blob reference in {origin}: {reason}")]
    InvalidEnvelope {
        /// Where the envelope came from
        origin: String,

        /// What is wrong with the envelope
        reason: String,
    },

    /// The referenced blob could not be read
    #[error("failed to read blob '{blob_name}'")]
    BlobRead {
        /// The referenced blob
        blob_name: String,

        /// The underlying storage failure
        #[source]
        error: BlobReadError,
    },

    /// A blob reference arrived but no blob storage is configured
    #[error("blob '{blob_name}' referenced but no blob storage is configured")]
    StorageNotConfigured {
        /// The referenced blob
        blob_name: String,
    },
}

impl DecodeError {
    /// Bad content never becomes good on redelivery; failing to fetch it might.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DecodeError::InvalidJson { .. } | DecodeError::InvalidEnvelope { .. }
        )
    }
}

/// Errors raised by the email service client while submitting or polling
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service answered with a non-success HTTP status
    #[error("email service returned HTTP {status}: {message}")]
    Http {
        /// The HTTP status code
        status: u16,

        /// The service error code, if one was returned
        code: Option<String>,

        /// The service error message or raw body
        message: String,
    },

    /// No credential could be obtained for the service
    #[error("could not authenticate with the email service")]
    Authentication(#[source] anyhow::Error),

    /// The service accepted the request without an operation to poll
    #[error("email service response is missing the Operation-Location header")]
    MissingOperationLocation,

    /// The operation did not finish in time
    #[error("timed out waiting for send operation {operation_id} to finish")]
    PollTimeout {
        /// The operation that was being polled
        operation_id: String,
    },

    /// The client could not be built from its configuration
    #[error("invalid email client configuration: {0}")]
    Configuration(String),

    /// Network or transport failure
    #[error("could not reach the email service: {0}")]
    Transport(anyhow::Error),
}

/// Errors raised by [`EmailDispatcher::send`](super::EmailDispatcher::send)
#[derive(Debug, Error)]
pub enum EmailDispatchError {
    /// The provider client failed; propagated unchanged
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The operation finished with a status other than "succeeded"
    #[error("ACS email send failed with status: {status}.")]
    Unsuccessful {
        /// The terminal status as reported, or `<absent>`
        status: String,

        /// The provider message id, if any
        message_id: Option<String>,

        /// The provider error detail, if any
        detail: Option<Value>,
    },
}

/// A failure that must be redelivered by the host
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The event content could not be fetched
    #[error(transparent)]
    Decode(DecodeError),

    /// The email could not be sent
    #[error(transparent)]
    Send(#[from] EmailDispatchError),
}

impl From<DecodeError> for DispatchError {
    fn from(err: DecodeError) -> Self {
        debug!("DecodeError -> DispatchError");

        DispatchError::Decode(err)
    }
}
