use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    cancel_submission_handler, get_languages_handler, get_stats_handler, get_submission_handler,
    json_error_handler, post_submission_handler, query_error_handler,
};
use crate::scheduler::Scheduler;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 12345;

/// Registers every route on an app; shared by the server and the tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .service(post_submission_handler)
        .service(get_submission_handler)
        .service(cancel_submission_handler)
        .service(get_languages_handler)
        .service(get_stats_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    scheduler: Arc<Scheduler>,
) -> std::io::Result<Server> {
    let scheduler = web::Data::from(scheduler);

    let bind_address = server_config
        .bind_address
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
    let bind_port = server_config.bind_port.unwrap_or(DEFAULT_BIND_PORT);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(scheduler.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((bind_address.as_str(), bind_port))?
    .disable_signals()
    .run();

    log::info!("Listening on {bind_address}:{bind_port}");
    Ok(server)
}
