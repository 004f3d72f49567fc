//! Score-feed intake. The feed adapter posts updates that are already
//! normalised into [`EventUpdate`].

use actix_web::{post, web, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;

use super::error_response;
use crate::app::Engine;
use crate::db::models::EventUpdate;
use crate::settlement::Ingested;

/// POST /api/events
#[post("/events")]
pub async fn ingest(engine: web::Data<Engine>, body: web::Json<EventUpdate>) -> impl Responder {
    let update = body.into_inner();
    match engine.orchestrator.ingest_event(&update, Utc::now()).await {
        Ok(Ingested::Applied { event_id, checks }) => HttpResponse::Accepted().json(json!({
            "outcome": "applied",
            "event_id": event_id,
            "checks": checks,
        })),
        Ok(Ingested::Duplicate) => HttpResponse::Ok().json(json!({ "outcome": "duplicate" })),
        Err(e) => error_response(&e),
    }
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(ingest);
}
