//! Ranked leaderboard pages.

use actix_web::{get, web, HttpResponse, Responder};
use serde::Deserialize;
use uuid::Uuid;

use super::error_response;
use crate::app::Engine;

/// Longest page a single request may ask for.
const MAX_PAGE: usize = 100;

#[derive(Deserialize)]
pub struct LeaderboardParams {
    /// Zero-based first position.
    pub start: Option<usize>,
    /// Zero-based last position, inclusive.
    pub end: Option<usize>,
}

/// GET /api/leaderboards/{id}?start=0&end=49
#[get("/leaderboards/{id}")]
pub async fn leaderboard(
    engine: web::Data<Engine>,
    path: web::Path<Uuid>,
    web::Query(params): web::Query<LeaderboardParams>,
) -> impl Responder {
    let start = params.start.unwrap_or(0);
    let end = params.end.unwrap_or(start.saturating_add(49));
    if end < start {
        return HttpResponse::BadRequest().body("end before start");
    }
    let end = end.min(start.saturating_add(MAX_PAGE - 1));

    match engine.leaderboards.page(path.into_inner(), start, end).await {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => error_response(&e),
    }
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(leaderboard);
}
