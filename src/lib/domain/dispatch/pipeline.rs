//! Decode, validate and dispatch pipeline

use std::sync::Arc;

use tracing::{error, info};

use super::{
    errors::{DecodeError, DispatchError, ValidationError},
    BlobReader, EmailDispatcher, EmailRequest, MessageDecoder, SendOutcome, TriggerEvent,
};

/// Why an event was consumed without sending anything
#[derive(Debug)]
pub enum SuppressReason {
    /// The content could not be decoded
    Decode(DecodeError),

    /// The content is not a valid email request
    Validation(ValidationError),
}

/// An event that must not be redelivered
#[derive(Debug)]
pub enum Consumed {
    /// The email was sent
    Sent(SendOutcome),

    /// The event carried bad data and was dropped after logging
    Suppressed(SuppressReason),
}

/// The entry point invoked once per trigger event.
///
/// `Ok` tells the host the event is consumed; `Err` tells it to redeliver.
/// Bad data (malformed JSON, failed validation) is logged and consumed, since
/// redelivering it can never succeed. Failing to fetch referenced content and
/// every dispatch failure are returned as errors.
#[derive(Debug)]
pub struct DispatchPipeline<D, B>
where
    D: EmailDispatcher,
    B: BlobReader,
{
    decoder: MessageDecoder<B>,
    dispatcher: Arc<D>,
}

impl<D, B> DispatchPipeline<D, B>
where
    D: EmailDispatcher,
    B: BlobReader,
{
    /// Creates a new pipeline
    pub fn new(decoder: MessageDecoder<B>, dispatcher: Arc<D>) -> Self {
        Self {
            decoder,
            dispatcher,
        }
    }

    /// Processes a single trigger event
    pub async fn process(&self, event: &TriggerEvent) -> Result<Consumed, DispatchError> {
        info!(origin = %event.origin(), "Processing trigger event");

        let payload = match self.decoder.decode(event).await {
            Ok(payload) => payload,
            Err(err) if err.is_permanent() => {
                error!(error = %err, "Dropping event with undecodable content");
                return Ok(Consumed::Suppressed(SuppressReason::Decode(err)));
            }
            Err(err) => {
                error!(
                    origin = %event.origin(),
                    error = %err,
                    "Failed to process event, it will be retried"
                );
                return Err(err.into());
            }
        };

        let request = match EmailRequest::validate(&payload.data) {
            Ok(request) => request,
            Err(err) => {
                error!(
                    origin = %payload.origin,
                    errors = %err,
                    "Invalid email message, validation failed"
                );
                return Ok(Consumed::Suppressed(SuppressReason::Validation(err)));
            }
        };

        info!(recipients = ?request.to(), "Received valid email request");

        let outcome = self.dispatcher.send(&request).await?;

        Ok(Consumed::Sent(outcome))
    }
}
