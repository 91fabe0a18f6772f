mod app;
mod routes;

pub mod config;
pub mod detection;
pub mod detector;
pub mod server;
pub mod telemetry;
pub mod vision;

pub use app::start_app;
