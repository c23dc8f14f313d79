//! Generic message loop for queue-driven worker binaries.
//!
//! One message is in flight at a time (the consumer's `max_ack_pending` is
//! 1): the current job always runs to completion before the next pull, and
//! a shutdown signal stops pulling without interrupting it.

use anyhow::Result;
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use sqlx::{Pool, Postgres};
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::BatchLimitsConfig;
use crate::detector::DetectorClient;
use crate::files::FilesClient;
use crate::{nats, subjects};

/// Configuration for worker initialization
pub struct WorkerConfig {
    pub service_name: String,
    pub queue_subject: String,
    pub consumer_config: ConsumerConfig,
    /// Maximum number of delivery attempts before the payload goes to the DLQ
    pub max_deliver: i64,
}

/// Collaborators handed to every job
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: Pool<Postgres>,
    pub nats_client: async_nats::Client,
    pub files: FilesClient,
    pub detector: DetectorClient,
    pub updates_subject: String,
    pub limits: BatchLimitsConfig,
}

/// Run the worker message loop with graceful shutdown support.
///
/// `process_job` returning `Ok` acks the message — including jobs that end
/// in a terminal Failed state, which are done as far as the queue is
/// concerned. An `Err` naks for redelivery until `max_deliver` is reached,
/// then the payload is parked on the DLQ subject and acked.
pub async fn run_worker<J, F, Fut>(
    config: WorkerConfig,
    context: WorkerContext,
    process_job: F,
) -> Result<()>
where
    J: DeserializeOwned + Send + 'static,
    F: Fn(J, WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    nats::initialize_jetstream(&context.nats_client, &config.queue_subject).await?;

    let jetstream = jetstream::new(context.nats_client.clone());
    let consumer = nats::ensure_consumer(
        &jetstream,
        subjects::ANALYSIS_STREAM,
        config.consumer_config.clone(),
    )
    .await?;

    info!(
        "Worker '{}' started, consuming '{}' on stream {}",
        config.service_name,
        config.queue_subject,
        subjects::ANALYSIS_STREAM
    );

    let mut messages = consumer.messages().await?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let msg = tokio::select! {
            maybe_msg = messages.next() => match maybe_msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    error!("Failed to receive message: {}", e);
                    continue;
                }
                None => {
                    warn!("Message stream closed, stopping worker");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received, no further messages will be pulled");
                break;
            }
        };

        let delivery_count = msg.info().map(|info| info.delivered).unwrap_or(1);

        let job: J = match serde_json::from_slice(&msg.payload) {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to deserialize job: {}", e);
                // Acknowledge to prevent reprocessing bad messages
                if let Err(ack_err) = msg.ack().await {
                    error!("Failed to acknowledge bad message: {}", ack_err);
                }
                continue;
            }
        };

        let job_span = info_span!(
            "process_worker_job",
            stream = subjects::ANALYSIS_STREAM,
            delivery_attempt = delivery_count,
        );

        match process_job(job, context.clone()).instrument(job_span).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    error!("Failed to acknowledge successful job: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Job failed (attempt {}/{}): {:#}",
                    delivery_count, config.max_deliver, e
                );

                if delivery_count >= config.max_deliver {
                    warn!(
                        "Max delivery attempts ({}) reached, sending to DLQ: {}",
                        config.max_deliver,
                        subjects::ANALYSIS_DLQ
                    );
                    if let Err(dlq_err) = jetstream
                        .publish(subjects::ANALYSIS_DLQ, msg.payload.clone())
                        .await
                    {
                        error!("Failed to publish to DLQ: {}", dlq_err);
                    }
                    if let Err(ack_err) = msg.ack().await {
                        error!("Failed to acknowledge DLQ'd message: {}", ack_err);
                    }
                } else if let Err(ack_err) = msg
                    .ack_with(async_nats::jetstream::AckKind::Nak(Some(
                        std::time::Duration::from_secs(30),
                    )))
                    .await
                {
                    error!("Failed to negatively acknowledge failed job: {}", ack_err);
                }
            }
        }
    }

    info!("Worker '{}' stopped", config.service_name);
    Ok(())
}

/// Wait for shutdown signals (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
