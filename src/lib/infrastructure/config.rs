//! Configuration module

use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::domain::dispatch::{AcsConnection, EmailAddress, EmailAddressError};

/// Startup configuration errors. Any of these stops the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither connection method is configured
    #[error("either ACS_CONNECTION_STRING or ACS_ENDPOINT must be set")]
    MissingAcsConnection,

    /// The sender address is not usable
    #[error("SENDER_EMAIL is not a valid email address: {0}")]
    InvalidSender(#[from] EmailAddressError),

    /// Only one of the blob storage settings is set
    #[error("INPUT_BLOB_CONTAINER and STORAGE_ACCOUNT_URL must be set together")]
    IncompleteBlobStorage,

    /// Polling without a pause between requests
    #[error("ACS_POLL_INTERVAL_SECS must be greater than zero")]
    ZeroPollInterval,

    /// A URL setting could not be parsed
    #[error("{name} is not a valid URL: {source}")]
    InvalidUrl {
        /// The setting name
        name: &'static str,

        /// The parser error
        source: url::ParseError,
    },
}

/// Azure Communication Services configuration
#[derive(Clone, Default, Debug, Parser)]
pub struct AcsConfig {
    /// The ACS connection string; takes precedence over the endpoint
    #[arg(long, env = "ACS_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,

    /// The ACS endpoint, used with the managed identity
    #[arg(long, env = "ACS_ENDPOINT")]
    pub endpoint: Option<String>,

    /// The address emails are sent from
    #[arg(long, env = "SENDER_EMAIL")]
    pub sender_email: String,

    /// Seconds between status polls when the service gives no Retry-After
    #[arg(long, env = "ACS_POLL_INTERVAL_SECS", default_value = "1")]
    pub poll_interval_secs: u64,

    /// Seconds to wait for a send operation to finish
    #[arg(long, env = "ACS_POLL_TIMEOUT_SECS", default_value = "300")]
    pub poll_timeout_secs: u64,
}

/// Blob storage configuration for queue messages that reference blobs
#[derive(Clone, Default, Debug, Parser)]
pub struct StorageConfig {
    /// The container holding referenced email requests
    #[arg(long, env = "INPUT_BLOB_CONTAINER")]
    pub input_blob_container: Option<String>,

    /// The blob service URL, e.g. `https://account.blob.core.windows.net`
    #[arg(long, env = "STORAGE_ACCOUNT_URL")]
    pub account_url: Option<String>,
}

/// Managed identity configuration
#[derive(Clone, Default, Debug, Parser)]
pub struct IdentityConfig {
    /// The App Service identity endpoint, set by the platform
    #[arg(long, env = "IDENTITY_ENDPOINT")]
    pub identity_endpoint: Option<String>,

    /// The App Service identity header, set by the platform
    #[arg(long, env = "IDENTITY_HEADER", hide_env_values = true)]
    pub identity_header: Option<String>,

    /// Client id of a user-assigned identity
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,
}

/// All dispatcher settings as read from the command line and environment
#[derive(Clone, Default, Debug, Parser)]
pub struct DispatcherConfig {
    /// Email service settings
    #[clap(flatten)]
    pub acs: AcsConfig,

    /// Blob storage settings
    #[clap(flatten)]
    pub storage: StorageConfig,

    /// Managed identity settings
    #[clap(flatten)]
    pub identity: IdentityConfig,
}

/// Where referenced blobs are read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobSource {
    /// The blob service URL
    pub account_url: Url,

    /// The container name
    pub container: String,
}

/// How status polling is paced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollingConfig {
    /// Wait between polls when the service gives no Retry-After
    pub interval: Duration,

    /// Give up on an operation after this long
    pub timeout: Duration,
}

/// Validated settings, built once at startup
#[derive(Clone, Debug)]
pub struct Settings {
    /// How to reach the email service
    pub acs: AcsConnection,

    /// The sender address
    pub sender: EmailAddress,

    /// Status polling
    pub polling: PollingConfig,

    /// Blob storage, if blob references are supported
    pub blob_source: Option<BlobSource>,

    /// Managed identity settings
    pub identity: IdentityConfig,
}

impl TryFrom<DispatcherConfig> for Settings {
    type Error = ConfigError;

    fn try_from(config: DispatcherConfig) -> Result<Self, Self::Error> {
        let acs = AcsConnection::select(
            config.acs.connection_string.as_deref(),
            config.acs.endpoint.as_deref(),
        )
        .ok_or(ConfigError::MissingAcsConnection)?;

        if let AcsConnection::Endpoint(endpoint) = &acs {
            parse_url("ACS_ENDPOINT", endpoint)?;
        }

        let sender = EmailAddress::new(&config.acs.sender_email)?;

        if config.acs.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        let blob_source = match (
            non_blank(config.storage.input_blob_container),
            non_blank(config.storage.account_url),
        ) {
            (Some(container), Some(account_url)) => Some(BlobSource {
                account_url: parse_url("STORAGE_ACCOUNT_URL", &account_url)?,
                container,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteBlobStorage),
        };

        if let Some(endpoint) = &config.identity.identity_endpoint {
            parse_url("IDENTITY_ENDPOINT", endpoint)?;
        }

        Ok(Self {
            acs,
            sender,
            polling: PollingConfig {
                interval: Duration::from_secs(config.acs.poll_interval_secs),
                timeout: Duration::from_secs(config.acs.poll_timeout_secs),
            },
            blob_source,
            identity: config.identity,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { name, source })
}
