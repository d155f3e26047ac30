//! ---
//! orch_section: "01-shared-primitives"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Shared primitives for the orchestrator workspace."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
//! Shared primitives for the platform orchestrator workspace: configuration
//! loading and tracing initialisation consumed by every other crate.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, EngineConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    ProviderConfig, RetryConfig,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
