//! The postrider daemon.
//!
//! Consumes newline-delimited JSON messages (`{"envelope": .., "recipient":
//! .., "body": ..}` plus optional retry bookkeeping) on stdin, runs each
//! through the delivery pipeline, and reports every outcome as one JSON
//! line on stdout with the queue the message should be republished to.
//! The broker consumer feeding stdin and the publisher reading stdout live
//! outside this process.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use postrider_common::{Config, MailMessage};
use postrider_delivery::Pipeline;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "postrider", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "postrider.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    postrider_common::logging::init(&config).context("initialising logging")?;

    let pipeline = Pipeline::new(config).context("building the pipeline")?;

    tokio::select! {
        result = ingest(&pipeline) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, draining");
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

/// Reads messages from stdin until EOF, submitting each and printing its
/// outcome when it lands.
async fn ingest(pipeline: &Pipeline) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut outcomes = tokio::task::JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let mut message: MailMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "can't parse message, skipping");
                continue;
            }
        };
        message.init();
        let id = message.id;

        let receiver = pipeline.submit(message).await?;
        outcomes.spawn(async move {
            let Ok(outcome) = receiver.await else {
                tracing::warn!(mail = id, "message dropped during shutdown");
                return;
            };
            let queue = outcome
                .republish_binding()
                .map_or("ack", |binding| binding.queue_name());
            println!(
                "{}",
                serde_json::json!({
                    "id": outcome.message.id,
                    "result": outcome.disposition.as_str(),
                    "queue": queue,
                    "error": outcome.message.error,
                })
            );
        });
    }

    // stdin is done; wait for the in-flight outcomes
    while outcomes.join_next().await.is_some() {}
    Ok(())
}
