pub mod config;
pub mod reporter;
pub mod service;
pub mod telemetry;
