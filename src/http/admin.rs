//! Operator surface: force-settle, void and retry a match; inspect and
//! replay dead-lettered jobs. Every action goes through the same service
//! entry points the workers use.

use actix_web::{get, post, web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::error_response;
use crate::app::{Engine, QUEUES};
use crate::settlement::{NotReadyReason, SettleOutcome, VoidOutcome};

#[derive(Deserialize)]
pub struct VoidReq {
    pub reason: Option<String>,
}

fn known_queue(name: &str) -> bool {
    QUEUES.iter().any(|(q, _, _)| *q == name)
}

/// POST /api/admin/matches/{id}/settle
#[post("/admin/matches/{id}/settle")]
pub async fn settle(engine: web::Data<Engine>, path: web::Path<Uuid>) -> impl Responder {
    match engine.orchestrator.force_settle(path.into_inner()).await {
        Ok(SettleOutcome::Settled(result)) => {
            HttpResponse::Ok().json(json!({ "outcome": "settled", "result": result }))
        }
        Ok(SettleOutcome::AlreadyFinal(status)) => {
            HttpResponse::Ok().json(json!({ "outcome": "already_final", "status": status }))
        }
        Ok(SettleOutcome::NotReady(reason)) => {
            let detail = match reason {
                NotReadyReason::NotActive(status) => format!("match is {status}"),
                NotReadyReason::EventsPending(n) => format!("{n} events unresolved"),
                NotReadyReason::AllCancelled => "all events cancelled, void queued".to_owned(),
            };
            HttpResponse::Conflict().json(json!({ "outcome": "not_ready", "detail": detail }))
        }
        Err(e) => error_response(&e),
    }
}

/// POST /api/admin/matches/{id}/void   body: `{"reason": "..."}` (optional)
#[post("/admin/matches/{id}/void")]
pub async fn void(
    engine: web::Data<Engine>,
    path: web::Path<Uuid>,
    body: Option<web::Json<VoidReq>>,
) -> impl Responder {
    let reason = body.and_then(|b| b.into_inner().reason);
    match engine
        .orchestrator
        .force_void(path.into_inner(), reason.as_deref())
        .await
    {
        Ok(VoidOutcome::Voided(v)) => {
            HttpResponse::Ok().json(json!({ "outcome": "voided", "result": v }))
        }
        Ok(VoidOutcome::AlreadyFinal(status)) => {
            HttpResponse::Ok().json(json!({ "outcome": "already_final", "status": status }))
        }
        Err(e) => error_response(&e),
    }
}

/// POST /api/admin/matches/{id}/retry
#[post("/admin/matches/{id}/retry")]
pub async fn retry(engine: web::Data<Engine>, path: web::Path<Uuid>) -> impl Responder {
    match engine.orchestrator.retry(path.into_inner()).await {
        Ok(handle) => HttpResponse::Accepted().json(handle),
        Err(e) => error_response(&e),
    }
}

/// GET /api/admin/queues/{queue}
#[get("/admin/queues/{queue}")]
pub async fn counts(engine: web::Data<Engine>, path: web::Path<String>) -> impl Responder {
    let queue = path.into_inner();
    if !known_queue(&queue) {
        return HttpResponse::NotFound().body("unknown queue");
    }
    match engine.queue.counts(&queue).await {
        Ok(c) => HttpResponse::Ok().json(c),
        Err(e) => error_response(&e),
    }
}

/// GET /api/admin/queues/{queue}/dead
#[get("/admin/queues/{queue}/dead")]
pub async fn dead_letters(engine: web::Data<Engine>, path: web::Path<String>) -> impl Responder {
    let queue = path.into_inner();
    if !known_queue(&queue) {
        return HttpResponse::NotFound().body("unknown queue");
    }
    match engine.queue.dead_letters(&queue).await {
        Ok(jobs) => HttpResponse::Ok().json(jobs),
        Err(e) => error_response(&e),
    }
}

/// POST /api/admin/queues/{queue}/dead/{job_id}/replay
#[post("/admin/queues/{queue}/dead/{job_id}/replay")]
pub async fn replay(
    engine: web::Data<Engine>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (queue, job_id) = path.into_inner();
    if !known_queue(&queue) {
        return HttpResponse::NotFound().body("unknown queue");
    }
    match engine.queue.replay_dead_letter(&queue, &job_id).await {
        Ok(Some(handle)) => {
            log::info!("replayed dead job {job_id} on {queue}");
            HttpResponse::Accepted().json(handle)
        }
        Ok(None) => HttpResponse::NotFound().body("no such dead job"),
        Err(e) => error_response(&e),
    }
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(settle)
        .service(void)
        .service(retry)
        .service(dead_letters)
        .service(replay)
        .service(counts);
}
