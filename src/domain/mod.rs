//! Pure telemetry logic and configuration.

pub mod csc;
pub mod models;
pub mod settings;
pub mod wrap;
