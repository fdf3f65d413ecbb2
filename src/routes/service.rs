use actix_web::{HttpResponse, Responder, get, web};

use crate::scheduler::Scheduler;

/// Languages offered by the editor's picker, sorted by id
#[get("/languages")]
pub async fn get_languages_handler(scheduler: web::Data<Scheduler>) -> impl Responder {
    let languages: Vec<_> = scheduler.registry().list().collect();
    HttpResponse::Ok().json(languages)
}

#[get("/stats")]
pub async fn get_stats_handler(scheduler: web::Data<Scheduler>) -> impl Responder {
    HttpResponse::Ok().json(scheduler.stats())
}
