//! Broker plumbing: durable work queue on JetStream, non-durable progress
//! fan-out on core NATS.

use anyhow::{Context, Result};
use async_nats::{
    Client,
    jetstream::{
        self,
        consumer::pull::Config as ConsumerConfig,
        stream::{Config as StreamConfig, RetentionPolicy},
    },
};
use std::time::Duration;
use tracing::{info, warn};

use crate::models::{AnalysisJobMessage, ProgressEvent};
use crate::subjects;

/// Startup connection attempts (30 x 10 s)
const CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Connect to the broker with bounded retries. The returned client
/// reconnects on its own afterwards.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match async_nats::connect(url).await {
            Ok(client) => {
                info!("Connected to NATS at {}", url);
                return Ok(client);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    "NATS connection failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt, CONNECT_ATTEMPTS, e, CONNECT_RETRY_DELAY
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to connect to NATS after {} attempts",
                    CONNECT_ATTEMPTS
                ));
            }
        }
    }
    unreachable!("retry loop always returns");
}

/// Ensure the durable work-queue stream exists with the configured subject
pub async fn initialize_jetstream(client: &Client, queue_subject: &str) -> Result<()> {
    let jetstream = jetstream::new(client.clone());

    ensure_stream(
        &jetstream,
        subjects::ANALYSIS_STREAM,
        StreamConfig {
            name: subjects::ANALYSIS_STREAM.to_string(),
            subjects: vec![queue_subject.to_string()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            duplicate_window: Duration::from_secs(5 * 60),  // 5 minutes for deduplication
            num_replicas: 1,
            ..Default::default()
        },
    )
    .await?;

    info!("JetStream stream initialized successfully");
    Ok(())
}

async fn ensure_stream(
    jetstream: &jetstream::Context,
    name: &str,
    config: StreamConfig,
) -> Result<()> {
    match jetstream.get_stream(name).await {
        Ok(mut stream) => {
            let current_config = stream.info().await?.config.clone();
            if stream_config_differs(&current_config, &config) {
                warn!(
                    "Stream '{}' exists but configuration differs. Updating stream.",
                    name
                );
                jetstream
                    .update_stream(config)
                    .await
                    .context(format!("Failed to update stream '{}'", name))?;
                info!("Stream '{}' updated successfully", name);
            } else {
                info!(
                    "Stream '{}' already exists with correct configuration",
                    name
                );
            }
        }
        Err(_) => {
            info!("Stream '{}' does not exist. Creating...", name);
            jetstream
                .create_stream(config)
                .await
                .context(format!("Failed to create stream '{}'", name))?;
            info!("Stream '{}' created successfully", name);
        }
    }
    Ok(())
}

fn stream_config_differs(current: &StreamConfig, desired: &StreamConfig) -> bool {
    current.name != desired.name
        || current.subjects != desired.subjects
        || current.retention != desired.retention
        || current.num_replicas != desired.num_replicas
}

/// Consumer for analysis jobs: explicit acks, one unacked message at a time
/// (a job monopolizes the detector, so a worker instance takes exactly one
/// job), two deliveries total — the second delivery is how a worker crash
/// is detected and the job declared failed.
pub fn analysis_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(subjects::ANALYSIS_CONSUMER.to_string()),
        description: Some("Consumer for batch analysis jobs".to_string()),
        ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
        ack_wait: Duration::from_secs(60 * 60),
        max_deliver: 2,
        max_ack_pending: 1,
        ..Default::default()
    }
}

pub async fn ensure_consumer(
    jetstream: &jetstream::Context,
    stream_name: &str,
    consumer_config: ConsumerConfig,
) -> Result<jetstream::consumer::Consumer<ConsumerConfig>> {
    let stream = jetstream
        .get_stream(stream_name)
        .await
        .context(format!("Failed to get stream '{}'", stream_name))?;

    let consumer_name = consumer_config
        .durable_name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Consumer config must have a durable_name"))?;

    match stream.get_consumer(&consumer_name).await {
        Ok(consumer) => {
            info!(
                "Consumer '{}' already exists on stream '{}'",
                consumer_name, stream_name
            );
            Ok(consumer)
        }
        Err(_) => {
            info!(
                "Creating consumer '{}' on stream '{}'",
                consumer_name, stream_name
            );
            let consumer = stream
                .create_consumer(consumer_config)
                .await
                .context(format!(
                    "Failed to create consumer '{}' on stream '{}'",
                    consumer_name, stream_name
                ))?;
            info!("Consumer '{}' created successfully", consumer_name);
            Ok(consumer)
        }
    }
}

/// Publish a job to the durable work queue (persistent, at-least-once)
pub async fn publish_job(
    client: &Client,
    queue_subject: &str,
    message: &AnalysisJobMessage,
) -> Result<()> {
    let jetstream = jetstream::new(client.clone());
    let payload = serde_json::to_vec(message)?;
    jetstream
        .publish(queue_subject.to_string(), payload.into())
        .await
        .context("Failed to publish analysis job")?
        .await
        .context("Analysis job publish was not acknowledged")?;
    Ok(())
}

/// Publish a progress event on the fan-out subject. Best effort and lossy:
/// nothing is persisted and there are no acks — the durable record is the
/// task row.
pub async fn publish_progress(
    client: &Client,
    updates_subject: &str,
    event: &ProgressEvent,
) -> Result<()> {
    let payload = serde_json::to_vec(event)?;
    client
        .publish(updates_subject.to_string(), payload.into())
        .await
        .context("Failed to publish progress event")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_differs() {
        let config1 = StreamConfig {
            name: "TEST".to_string(),
            subjects: vec!["test.subject".to_string()],
            retention: RetentionPolicy::WorkQueue,
            num_replicas: 1,
            ..Default::default()
        };

        let config2 = config1.clone();
        assert!(!stream_config_differs(&config1, &config2));

        let config3 = StreamConfig {
            name: "TEST".to_string(),
            subjects: vec!["different.subject".to_string()],
            retention: RetentionPolicy::WorkQueue,
            num_replicas: 1,
            ..Default::default()
        };
        assert!(stream_config_differs(&config1, &config3));
    }

    #[test]
    fn test_analysis_consumer_is_single_flight() {
        let config = analysis_consumer_config();
        assert_eq!(config.max_ack_pending, 1);
        assert_eq!(config.max_deliver, 2);
        assert_eq!(
            config.durable_name.as_deref(),
            Some(subjects::ANALYSIS_CONSUMER)
        );
    }
}
