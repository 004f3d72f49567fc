//! Simple liveness / readiness probe

use actix_web::{get, web, HttpResponse, Responder};

use crate::app::Engine;

#[get("/healthz")]
pub async fn healthz(engine: web::Data<Engine>) -> impl Responder {
    match engine.health().await {
        Ok(()) => HttpResponse::Ok().body("ok"),
        Err(backend) => HttpResponse::ServiceUnavailable().body(backend),
    }
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(healthz);
}
