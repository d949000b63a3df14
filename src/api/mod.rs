//! API layer
//!
//! HTTP handlers for:
//! - Federation (actor and note documents, inbox)
//! - Metrics (Prometheus)

mod activitypub;
mod metrics;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
