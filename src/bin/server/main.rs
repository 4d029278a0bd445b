#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::missing_crate_level_docs
)]

//! Azure Functions custom handler for the email dispatcher

use std::{sync::Arc, time::Duration};

use acs_email_dispatcher::{
    domain::dispatch::{connect, AcsEmailDispatcher, DispatchPipeline, MessageDecoder},
    infrastructure::{
        azure::{AcsClientFactory, AzureBlobReader, ManagedIdentityCredential, TokenCredential},
        config::{DispatcherConfig, Settings},
        http::{FunctionsServer, FunctionsServerConfig},
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments / environment variables
#[derive(Debug, Parser)]
pub struct Args {
    /// The custom handler server configuration
    #[clap(flatten)]
    pub server: FunctionsServerConfig,

    /// The dispatcher configuration
    #[clap(flatten)]
    pub dispatcher: DispatcherConfig,
}

#[mutants::skip]
#[tokio::main]
async fn main() -> Result<()> {
    // Settings come from the Functions app settings in production
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::try_from(args.dispatcher).context("invalid configuration")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build the HTTP client")?;

    let credential: Arc<dyn TokenCredential> = Arc::new(
        ManagedIdentityCredential::new(http.clone(), &settings.identity)
            .context("invalid managed identity endpoint")?,
    );

    let factory = AcsClientFactory::new(http.clone(), settings.polling, Arc::clone(&credential));
    let client = connect(&factory, &settings.acs).context("failed to create the email client")?;
    let dispatcher = AcsEmailDispatcher::new(Arc::new(client), settings.sender.clone());

    let blobs = settings.blob_source.clone().map(|source| {
        info!(container = %source.container, "Blob references enabled");
        Arc::new(AzureBlobReader::new(http.clone(), source, Arc::clone(&credential)))
    });

    let pipeline = DispatchPipeline::new(MessageDecoder::new(blobs), Arc::new(dispatcher));

    FunctionsServer::new(pipeline, &args.server)?.run().await
}
