//! Azure REST adapters: Communication Services email, Blob Storage and managed identity

pub mod blob;
pub mod connection_string;
pub mod credential;
pub mod email_client;

pub use blob::AzureBlobReader;
pub use connection_string::AcsConnectionString;
pub use credential::{AccessToken, CredentialError, ManagedIdentityCredential, TokenCredential};
pub use email_client::{AcsClientFactory, AcsEmailClient};


/// RFC 1123 date, as used by the `x-ms-date` family of headers
pub(crate) fn http_date(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
