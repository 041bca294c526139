pub mod auth;
pub mod cache;
pub mod client;
pub mod clock;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod handlers;
pub mod host;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tracker;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<gate::Gate>,
    /// Optional bearer key protecting the operator routes.
    pub admin_key: Option<String>,
}

pub use client::{AuthClient, ClientConfig, Disposition, LinkOutcome, ValidateOutcome};
pub use engine::{LinkEngine, LinkState};
pub use error::{GateError, GateResult};
pub use gate::{Gate, GateSettings};
pub use server::{build, resolve_data_dir, router, run, GateConfig};
pub use tracker::{ModuleRecord, ModuleTracker, ScanMode};
