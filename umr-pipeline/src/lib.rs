//! umr-pipeline library interface
//!
//! Exposes public APIs for integration testing

pub mod api;
pub mod capture;
pub mod chain;
pub mod config;
pub mod error;
pub mod image_ops;
pub mod providers;
pub mod sink;
pub mod storage;
pub mod types;
pub mod validator;
pub mod workflow;

pub use crate::error::{ApiError, ApiResult, PipelineError};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::workflow::Orchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::meter_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
