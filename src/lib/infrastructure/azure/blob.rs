//! Azure Blob Storage reader

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::{http_date, TokenCredential};
use crate::{
    domain::dispatch::{errors::BlobReadError, BlobReader},
    infrastructure::config::BlobSource,
};

const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const STORAGE_API_VERSION: &str = "2021-08-06";

impl From<reqwest::Error> for BlobReadError {
    fn from(err: reqwest::Error) -> Self {
        BlobReadError::Transport(err.into())
    }
}

/// Reads blobs from the configured container using the managed identity
#[derive(Debug)]
pub struct AzureBlobReader {
    http: reqwest::Client,
    source: BlobSource,
    credential: Arc<dyn TokenCredential>,
}

impl AzureBlobReader {
    /// Creates a new reader
    pub fn new(
        http: reqwest::Client,
        source: BlobSource,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http,
            source,
            credential,
        }
    }

    /// `{account}/{container}/{blob}`; slashes in the blob name are kept as
    /// virtual directories.
    fn blob_url(&self, blob_name: &str) -> Result<Url, BlobReadError> {
        let mut url = self.source.account_url.clone();

        url.path_segments_mut()
            .map_err(|_| {
                BlobReadError::Transport(anyhow!(
                    "storage account URL '{}' cannot hold a path",
                    self.source.account_url
                ))
            })?
            .pop_if_empty()
            .push(&self.source.container)
            .extend(blob_name.split('/'));

        Ok(url)
    }
}

#[async_trait]
impl BlobReader for AzureBlobReader {
    async fn read_blob(&self, blob_name: &str) -> Result<Vec<u8>, BlobReadError> {
        let url = self.blob_url(blob_name)?;

        let token = self
            .credential
            .get_token(STORAGE_SCOPE)
            .await
            .map_err(|err| BlobReadError::Authentication(err.into()))?;

        debug!(%url, "Downloading blob");

        let response = self
            .http
            .get(url)
            .bearer_auth(token.token)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-date", http_date(Utc::now()))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(BlobReadError::NotFound {
                blob_name: blob_name.to_string(),
            }),
            status => Err(BlobReadError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
