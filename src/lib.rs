pub mod config;
pub mod controller;
pub mod error;
pub mod error_sink;
pub mod link;
pub mod messages;
pub mod panel;
pub mod profile;
pub mod telemetry;
