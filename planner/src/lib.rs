//! Region-level planning on top of node resource reports.
//!
//! - [`summary`] rewrites per-node reports into region summaries and sums them
//! - [`plan`] builds and validates a region's load-balancer plan against the
//!   containers actually running there

pub mod error;
pub mod models;
pub mod plan;
pub mod summary;

pub use error::{PlannerError, Result};
pub use models::*;
pub use plan::LoadBalancerPlanBuilder;
pub use summary::{ResourceAggregator, ResourceSummary, SumMerge};
