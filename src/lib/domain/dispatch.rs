//! Email dispatch module.

mod decoder;
mod dispatcher;
mod email_address;
mod email_request;
mod outcome;
mod pipeline;
mod provider;

pub mod errors;

pub use decoder::{BlobReader, DecodedPayload, MessageDecoder, TriggerEvent};
pub use dispatcher::{AcsEmailDispatcher, EmailDispatcher};
pub use email_address::{EmailAddress, EmailAddressError};
pub use email_request::EmailRequest;
pub use outcome::{SendOutcome, SendStatus};
pub use pipeline::{Consumed, DispatchPipeline, SuppressReason};
pub use provider::{
    connect, AcsConnection, EmailClient, EmailClientFactory, EmailContent, EmailRecipient,
    EmailRecipients, OperationHandle, SendEmailPayload,
};
