//! Administrative HTTP API for umr-pipeline

pub mod health;
pub mod meters;

pub use health::health_routes;
pub use meters::meter_routes;
