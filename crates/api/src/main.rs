mod analysis;
mod api;
mod auth;
mod errors;
mod hub;

use actix_cors::Cors;
use actix_multipart::form::MultipartFormConfig;
use actix_web::{
    App, HttpServer,
    http::header,
    middleware::{Compress, DefaultHeaders},
    web,
};
use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;
use utoipa::OpenApi;
use utoipa_actix_web::AppExt;
use utoipa_swagger_ui::SwaggerUi;

use lineguard_core::annotator::AnnotatorClient;
use lineguard_core::config::AppConfig;
use lineguard_core::detector::DetectorClient;
use lineguard_core::files::FilesClient;
use lineguard_core::http_client::HTTP_CLIENT;
use lineguard_core::{nats, observability, tasks};

/// Headroom over the configured batch cap so multipart framing does not
/// push a maximal upload over the limit
const MULTIPART_SLACK_BYTES: usize = 64 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(info(title = "LineGuard Analysis"))]
struct ApiDoc;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Load centralized configuration - fail fast if required config is missing
    let config = AppConfig::from_env()?;
    observability::init_tracing(&config.observability)?;

    let hostname = config.server.hostname.clone();
    let port = config.server.port;
    let shutdown_timeout = config.server.shutdown_timeout_secs.unwrap_or(30);

    let postgres_pool = tasks::initialize_pool(&config.database).await?;
    let nats_client = nats::connect_with_retry(&config.nats.url).await?;
    nats::initialize_jetstream(&nats_client, &config.nats.queue_subject).await?;

    let files_client = FilesClient::new(&config.services.files_service_url, HTTP_CLIENT.clone());
    let detector_client = DetectorClient::new(
        &config.services.detector_url,
        HTTP_CLIENT.clone(),
        &config.limits,
    );
    let annotator_client =
        AnnotatorClient::new(&config.services.annotation_service_url, HTTP_CLIENT.clone());

    // Progress hub plus its broker-side consumer
    let progress_hub = Arc::new(hub::ProgressHub::new());
    let updates_consumer_handle = {
        let nats = nats_client.clone();
        let subject = config.nats.updates_subject.clone();
        let hub = progress_hub.clone();
        tokio::spawn(hub::run_updates_consumer(nats, subject, hub))
    };

    // Keep references for graceful shutdown
    let nats_shutdown = nats_client.clone();
    let postgres_shutdown = postgres_pool.clone();

    let cors_origins = config.server.cors_allowed_origins.clone();
    let address = format!("http://{}:{}", hostname, port);
    let multipart_limit = config.limits.max_batch_size_bytes as usize + MULTIPART_SLACK_BYTES;

    let auth_config = config.auth.clone();
    let limits_config = config.limits.clone();
    let nats_config = config.nats.clone();

    let server = HttpServer::new(move || {
        // Build CORS configuration based on allowed origins
        let cors = if cors_origins.is_empty() {
            Cors::default()
                .allowed_origin(&address)
                .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .allowed_headers(vec![
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                ])
                .supports_credentials()
                .max_age(3600)
        } else {
            let mut cors = Cors::default()
                .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .allowed_headers(vec![
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                ])
                .supports_credentials()
                .max_age(3600);
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        let security_headers = DefaultHeaders::new()
            .add(("X-Content-Type-Options", "nosniff"))
            .add(("X-Frame-Options", "DENY"))
            .add(("Referrer-Policy", "strict-origin-when-cross-origin"));

        App::new()
            .wrap(cors)
            .wrap(security_headers)
            .wrap(Compress::default())
            .app_data(web::Data::new(postgres_pool.clone()))
            .app_data(web::Data::new(nats_client.clone()))
            .app_data(web::Data::new(files_client.clone()))
            .app_data(web::Data::new(detector_client.clone()))
            .app_data(web::Data::new(annotator_client.clone()))
            .app_data(web::Data::new(auth_config.clone()))
            .app_data(web::Data::new(limits_config.clone()))
            .app_data(web::Data::new(nats_config.clone()))
            .app_data(web::Data::from(progress_hub.clone()))
            .app_data(
                MultipartFormConfig::default()
                    .total_limit(multipart_limit)
                    .memory_limit(multipart_limit),
            )
            .into_utoipa_app()
            .openapi(ApiDoc::openapi())
            .service(api::predict::create_batch_task)
            .service(api::analysis::get_task)
            .service(api::analysis::list_tasks)
            .service(api::analysis::get_task_images)
            .service(api::analysis::delete_task_image)
            .service(api::analysis::delete_task)
            .service(api::analysis::annotate_image)
            .service(api::analysis::save_image_metrics)
            .service(api::analysis::get_image_metrics)
            .openapi_service(|api_doc| {
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api/openapi.json", api_doc)
            })
            .into_app()
            // WebSocket and health endpoints live outside the OpenAPI surface
            .service(api::ws::task_updates)
            .service(api::ws::history_updates)
            .service(api::health::health)
            .service(api::health::liveness)
            .service(api::health::readiness)
            .service(api::base)
    });

    // Bind server with optional TLS
    let result = if config.tls.server_ssl_enabled {
        let cert_path = config.tls.server_cert_path.clone().ok_or_else(|| {
            anyhow::anyhow!("server_cert_path is required when SERVER_SSL_ENABLED=true")
        })?;
        let key_path = config.tls.server_key_path.clone().ok_or_else(|| {
            anyhow::anyhow!("server_key_path is required when SERVER_SSL_ENABLED=true")
        })?;

        let rustls_config = load_tls_config(&cert_path, &key_path)?;

        info!("server running at https://{}:{}", hostname, port);
        server
            .bind_rustls_0_23((hostname, port), rustls_config)?
            .shutdown_timeout(shutdown_timeout)
            .run()
            .await
    } else {
        info!("server running at http://{}:{}", hostname, port);
        server
            .bind((hostname, port))?
            .shutdown_timeout(shutdown_timeout)
            .run()
            .await
    };

    result?;

    info!("Shutting down gracefully...");

    updates_consumer_handle.abort();

    // Drain NATS client - flush pending messages
    if let Err(e) = nats_shutdown.drain().await {
        tracing::warn!(error = %e, "Failed to drain NATS client");
    }

    postgres_shutdown.close().await;

    info!("Server shutdown complete");

    Ok(())
}

/// Load rustls configuration from certificate and key files
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    use std::fs;

    let cert_contents = fs::read_to_string(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to read certificate file {}: {}", cert_path, e))?;

    let cert_pem = pem::parse(&cert_contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate PEM: {}", e))?;

    if cert_pem.tag() != "CERTIFICATE" {
        return Err(anyhow::anyhow!(
            "Invalid certificate file: expected CERTIFICATE tag, got {}",
            cert_pem.tag()
        ));
    }

    let cert_chain = vec![rustls::pki_types::CertificateDer::from(
        cert_pem.contents().to_vec(),
    )];

    let key_contents = fs::read_to_string(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to read key file {}: {}", key_path, e))?;

    let key_pem = pem::parse(&key_contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key PEM: {}", e))?;

    let key_der = key_pem.contents().to_vec();

    // Support multiple key formats: PKCS#8, RSA, and EC
    let private_key = match key_pem.tag() {
        "PRIVATE KEY" => rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(key_der),
        ),
        "RSA PRIVATE KEY" => rustls::pki_types::PrivateKeyDer::Pkcs1(
            rustls::pki_types::PrivatePkcs1KeyDer::from(key_der),
        ),
        "EC PRIVATE KEY" => rustls::pki_types::PrivateKeyDer::Sec1(
            rustls::pki_types::PrivateSec1KeyDer::from(key_der),
        ),
        tag => {
            return Err(anyhow::anyhow!(
                "Unsupported private key format: {}. Expected PRIVATE KEY, RSA PRIVATE KEY, or EC PRIVATE KEY",
                tag
            ));
        }
    };

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Invalid certificate or key: {}", e))?;

    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(server_config)
}
