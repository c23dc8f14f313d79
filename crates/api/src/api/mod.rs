pub(crate) mod analysis;
pub(crate) mod health;
pub(crate) mod predict;
pub(crate) mod ws;

use actix_web::{HttpResponse, Responder, get};

#[get("/")]
pub(crate) async fn base() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "message": "LineGuard analysis service is running" }))
}
