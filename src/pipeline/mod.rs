//! Crawl pipeline.
//!
//! - `driver`: selects jobs for an invocation and ticks each once
//! - `tick`: the per-job state machine
//! - `throttle`: per-job token bucket
//! - `graph`: GML export of a finished crawl

pub mod driver;
pub mod graph;
pub mod throttle;
pub mod tick;

pub use driver::{AccessPolicy, Caller, Driver, Invocation, JobReport, JobResult, Target};
pub use graph::export_graph;
pub use throttle::Throttle;
pub use tick::{TickEngine, TickOutcome, TickSettings};
