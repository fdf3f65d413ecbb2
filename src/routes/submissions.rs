use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use super::{invalid_argument, service_error};
use crate::results::ExecutionStatus;
use crate::scheduler::{Scheduler, SubmitRequest};

/// Upper bound on how long a single long-poll request may hold the connection
pub const MAX_WAIT_MS: u64 = 30_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    submission_id: String,
}

#[derive(Serialize)]
struct CancelResponse {
    status: ExecutionStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultQueryParams {
    pub wait_ms: Option<u64>,
}

#[post("/submissions")]
pub async fn post_submission_handler(
    scheduler: web::Data<Scheduler>,
    body: web::Json<SubmitRequest>,
) -> impl Responder {
    if body.client_id.trim().is_empty() {
        return invalid_argument("clientId must not be empty".to_string());
    }

    match scheduler.submit(body.into_inner()) {
        Ok(submission_id) => HttpResponse::Ok().json(SubmitResponse { submission_id }),
        Err(e) => {
            log::info!("Submission rejected: {e}");
            service_error(&e)
        }
    }
}

#[get("/submissions/{id}")]
pub async fn get_submission_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(String,)>,
    query: web::Query<ResultQueryParams>,
) -> impl Responder {
    let submission_id = path.into_inner().0;

    let result = match query.wait_ms {
        Some(wait_ms) if wait_ms > 0 => {
            let timeout = Duration::from_millis(wait_ms.min(MAX_WAIT_MS));
            scheduler.wait_result(&submission_id, timeout).await
        }
        _ => scheduler.result(&submission_id),
    };

    match result {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => service_error(&e),
    }
}

#[post("/submissions/{id}/cancel")]
pub async fn cancel_submission_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let submission_id = path.into_inner().0;

    match scheduler.cancel(&submission_id) {
        Ok(status) => HttpResponse::Ok().json(CancelResponse { status }),
        Err(e) => service_error(&e),
    }
}
