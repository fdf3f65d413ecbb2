pub mod config;
pub mod error;
pub mod languages;
pub mod queue;
pub mod quota;
pub mod results;
pub mod routes;
pub mod sandbox;
pub mod scheduler;
pub mod slots;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
