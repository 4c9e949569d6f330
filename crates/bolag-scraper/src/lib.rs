//! Scraping engine for Swedish corporate financial data from allabolag.se.
//!
//! The pipeline runs in three stages — segmentation, company-id resolution,
//! financial fetch — behind an adaptive rate limiter, a mandatory-proxy
//! gateway, and a cookie/CSRF/build-id session layer. Progress is
//! checkpointed into the per-job staging store so every stage is resumable
//! after a crash, pause, or operator fix.

pub mod checkpoint;
pub mod controller;
pub mod migrator;
pub mod proxy;
pub mod rate_limiter;
pub mod session;
pub mod stages;
pub mod validator;
pub mod wire;

pub use controller::{JobController, JobView};
pub use migrator::{
    InMemoryProductionStore, MigrateOptions, MigrationSummary, Migrator, ProductionStore,
    SqliteProductionStore,
};
pub use proxy::{GatewayResponse, GatewayStats, Provider, ProxyGateway};
pub use rate_limiter::{AdaptiveRateLimiter, NightMode, RateLimitStats, StageLimits};
pub use session::{Session, SessionAttempt, UpstreamSession, UPSTREAM_BASE_URL};
pub use stages::segmentation::SegmentationPreview;
pub use stages::{JobHandle, StageExit};
pub use validator::{validate, Validation, ValidationSummary};

/// Re-export commonly used types
pub use bolag_core::{ScrapeError, ScrapeResult};
