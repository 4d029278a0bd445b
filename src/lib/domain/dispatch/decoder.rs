//! Trigger event decoding

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::mock;

use super::errors::{BlobReadError, DecodeError};

/// The key marking a queue message as a reference to a blob
const BLOB_NAME_KEY: &str = "blob_name";

/// An inbound event delivered by the host runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// A storage queue message
    QueueMessage {
        /// The queue message id, if the host supplied one
        id: Option<String>,

        /// The raw message body
        body: Vec<u8>,
    },

    /// A newly created blob
    BlobCreated {
        /// The blob path
        name: String,

        /// The raw blob content
        content: Vec<u8>,
    },
}

impl TriggerEvent {
    /// A human readable identifier for logs
    pub fn origin(&self) -> String {
        match self {
            TriggerEvent::QueueMessage { id: Some(id), .. } => format!("queue message '{id}'"),
            TriggerEvent::QueueMessage { id: None, .. } => "queue message".to_string(),
            TriggerEvent::BlobCreated { name, .. } => format!("blob '{name}'"),
        }
    }
}

/// Decoded JSON along with where it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// The event or blob the data was read from
    pub origin: String,

    /// The parsed JSON document
    pub data: Value,
}

/// Reads blobs referenced by queue messages
#[async_trait]
pub trait BlobReader: Send + Sync + 'static {
    /// Downloads the content of `blob_name` from the configured container
    async fn read_blob(&self, blob_name: &str) -> Result<Vec<u8>, BlobReadError>;
}

#[cfg(test)]
mock! {
    pub BlobReader {}

    #[async_trait]
    impl BlobReader for BlobReader {
        async fn read_blob(&self, blob_name: &str) -> Result<Vec<u8>, BlobReadError>;
    }
}

enum Envelope {
    Direct(Value),
    BlobReference(String),
}

impl Envelope {
    /// Only a JSON object with a `blob_name` key is treated as a reference.
    fn classify(data: Value, origin: &str) -> Result<Self, DecodeError> {
        let reference = match data.as_object().and_then(|o| o.get(BLOB_NAME_KEY)) {
            None => return Ok(Envelope::Direct(data)),
            Some(reference) => reference,
        };

        let invalid = |reason: String| DecodeError::InvalidEnvelope {
            origin: origin.to_string(),
            reason,
        };

        match reference.as_str().map(str::trim) {
            Some(name) if name.is_empty() => Err(invalid(format!(
                "'{BLOB_NAME_KEY}' must be a non-empty string"
            ))),
            Some(name) if !is_plain_blob_path(name) => Err(invalid(format!(
                "'{BLOB_NAME_KEY}' must not contain empty, '.' or '..' path segments"
            ))),
            Some(name) => Ok(Envelope::BlobReference(name.to_string())),
            None => Err(invalid(format!(
                "'{BLOB_NAME_KEY}' must be a non-empty string"
            ))),
        }
    }
}

/// URL resolution would collapse these segments onto a different blob.
fn is_plain_blob_path(name: &str) -> bool {
    name.split('/')
        .all(|segment| !matches!(segment, "" | "." | ".."))
}

/// Turns trigger events into JSON payloads.
///
/// Blob content is always the payload itself. A queue message is either the
/// payload or a `{"blob_name": "..."}` envelope, in which case the blob is
/// read through the [`BlobReader`] and parsed instead. Only one level of
/// indirection is followed.
#[derive(Debug)]
pub struct MessageDecoder<B>
where
    B: BlobReader,
{
    blobs: Option<Arc<B>>,
}

impl<B> MessageDecoder<B>
where
    B: BlobReader,
{
    /// Creates a decoder. Without a blob reader, blob references cannot be followed.
    pub fn new(blobs: Option<Arc<B>>) -> Self {
        Self { blobs }
    }

    /// Decodes a trigger event
    pub async fn decode(&self, event: &TriggerEvent) -> Result<DecodedPayload, DecodeError> {
        let origin = event.origin();

        match event {
            TriggerEvent::BlobCreated { content, .. } => Ok(DecodedPayload {
                data: parse(content, &origin)?,
                origin,
            }),
            TriggerEvent::QueueMessage { body, .. } => {
                match Envelope::classify(parse(body, &origin)?, &origin)? {
                    Envelope::Direct(data) => Ok(DecodedPayload { origin, data }),
                    Envelope::BlobReference(blob_name) => self.fetch(blob_name).await,
                }
            }
        }
    }

    async fn fetch(&self, blob_name: String) -> Result<DecodedPayload, DecodeError> {
        let Some(blobs) = &self.blobs else {
            return Err(DecodeError::StorageNotConfigured { blob_name });
        };

        debug!(%blob_name, "Reading referenced blob");

        let content = match blobs.read_blob(&blob_name).await {
            Ok(content) => content,
            Err(error) => return Err(DecodeError::BlobRead { blob_name, error }),
        };

        let origin = format!("blob '{blob_name}'");

        Ok(DecodedPayload {
            data: parse(&content, &origin)?,
            origin,
        })
    }
}

fn parse(content: &[u8], origin: &str) -> Result<Value, DecodeError> {
    serde_json::from_slice(content).map_err(|error| DecodeError::InvalidJson {
        origin: origin.to_string(),
        error,
    })
}
