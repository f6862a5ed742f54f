pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod store;
pub mod telemetry;
pub mod upstream;
