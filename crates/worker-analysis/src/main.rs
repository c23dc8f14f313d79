use anyhow::Result;
use dotenvy::dotenv;
use lineguard_core::{
    config::{AppConfig, ObservabilityConfig},
    detector::DetectorClient,
    files::FilesClient,
    http_client::HTTP_CLIENT,
    nats::{analysis_consumer_config, connect_with_retry},
    observability, tasks,
    worker::{self, WorkerConfig, WorkerContext},
};

mod job;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| "worker-analysis".to_string());
    let mut observability_config = ObservabilityConfig::from_env()?;
    observability_config.service_name = service_name.clone();
    observability::init_tracing(&observability_config)?;

    let config = AppConfig::from_env()?;

    let postgres_pool = tasks::initialize_pool(&config.database).await?;
    let nats_client = connect_with_retry(&config.nats.url).await?;

    let files_client = FilesClient::new(&config.services.files_service_url, HTTP_CLIENT.clone());
    let detector_client = DetectorClient::new(
        &config.services.detector_url,
        HTTP_CLIENT.clone(),
        &config.limits,
    );

    let context = WorkerContext {
        pool: postgres_pool,
        nats_client,
        files: files_client,
        detector: detector_client,
        updates_subject: config.nats.updates_subject.clone(),
        limits: config.limits.clone(),
    };

    let worker_config = WorkerConfig {
        service_name,
        queue_subject: config.nats.queue_subject.clone(),
        consumer_config: analysis_consumer_config(),
        max_deliver: 2, // Matches consumer config
    };

    worker::run_worker(worker_config, context, job::process_analysis_job).await
}
