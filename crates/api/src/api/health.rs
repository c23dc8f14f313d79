use actix_web::{HttpResponse, Responder, get, web::Data};
use sqlx::{Pool, Postgres};

use lineguard_core::detector::DetectorClient;

/// Service health including the detector dependency
#[get("/health")]
pub(crate) async fn health(detector_client: Data<DetectorClient>) -> impl Responder {
    let detector_status = detector_client.health().await;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "lineguard",
        "dependencies": {
            "yolov8-model-service": detector_status,
        }
    }))
}

/// Liveness probe: the process is up
#[get("/health/live")]
pub(crate) async fn liveness() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe: the database answers
#[get("/health/ready")]
pub(crate) async fn readiness(postgres_pool: Data<Pool<Postgres>>) -> impl Responder {
    match sqlx::query("SELECT 1").execute(postgres_pool.get_ref()).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "status": "ready" })),
        Err(e) => HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({ "status": "not ready", "error": e.to_string() })),
    }
}
