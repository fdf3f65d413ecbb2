mod service;
mod submissions;

pub use service::{get_languages_handler, get_stats_handler};
pub use submissions::{
    cancel_submission_handler, get_submission_handler, post_submission_handler,
};

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::ServiceError;

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

fn invalid_argument(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: "InvalidArgument",
        message,
    })
}

/// Maps a client-facing error to its HTTP response
pub(crate) fn service_error(err: &ServiceError) -> HttpResponse {
    let status = match err {
        ServiceError::UnsupportedLanguage(_)
        | ServiceError::EmptySource
        | ServiceError::SourceTooLarge { .. } => StatusCode::BAD_REQUEST,
        ServiceError::QueueFull
        | ServiceError::RateLimited(_)
        | ServiceError::ConcurrencyLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    HttpResponse::build(status).json(ErrorResponse {
        error: err.reason(),
        message: err.to_string(),
    })
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = invalid_argument(err.to_string());
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = invalid_argument(err.to_string());
    InternalError::from_response(err, response).into()
}
