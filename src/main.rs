//! HITL SDK - document submission entry point
//!
//! Submits image files as one document, waits for the backend to finish it
//! and prints the result as JSON.
//!
//! Usage: `hitl-sdk <document_type> <image>...`

use anyhow::{bail, Context};
use hitl_sdk::gateway::{DocumentModes, DocumentRequest};
use hitl_sdk::{HitlClient, ImagePayload, Provider};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hitl_sdk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(document_type) = args.next() else {
        bail!("usage: hitl-sdk <document_type> <image>...");
    };
    let paths: Vec<String> = args.collect();
    if paths.is_empty() {
        bail!("no images given");
    }

    let mut images = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path))?;
        images.push(ImagePayload::Bytes(bytes));
    }

    let mut client = HitlClient::from_env()?;
    info!(provider = %client.config().provider, images = images.len(), "Loaded configuration");

    // Ctrl-C stops the wait loop cleanly
    let cancel = client.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let modes = match client.config().provider {
        Provider::Handl => DocumentModes::ocr_only(),
        Provider::Toloka => DocumentModes::default(),
    };
    let request = DocumentRequest {
        document_type: Some(document_type),
        modes,
        ..DocumentRequest::default()
    };

    client.create_document(images, request).await?;
    let tasks = client.wait_until_complete().await?;

    let output = serde_json::json!({
        "document": client.document(),
        "tasks": tasks,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
