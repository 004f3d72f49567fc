pub mod admin;
pub mod events;
pub mod health;
pub mod leaderboard;
pub mod routes;

use actix_web::HttpResponse;

use crate::error::EngineError;

/// Map an engine error onto a status code.
pub(crate) fn error_response(e: &EngineError) -> HttpResponse {
    match e {
        EngineError::NotFound { .. } => HttpResponse::NotFound().body(e.to_string()),
        EngineError::Conflict { .. } | EngineError::NotReady(_) => {
            HttpResponse::Conflict().body(e.to_string())
        }
        EngineError::AlreadyDone(_) => HttpResponse::Ok().body(e.to_string()),
        EngineError::Unexpected(_) => {
            tracing::error!(error = %e, "request failed");
            HttpResponse::InternalServerError().body("internal error")
        }
    }
}
