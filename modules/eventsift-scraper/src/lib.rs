//! Intelligent event scraping.
//!
//! Fetch a page, let a model (or a previously approved method) find the
//! events on it, normalize their dates, and persist them with dedup and
//! best-effort geocoding. The entry point is [`pipeline::ScrapePipeline`];
//! [`batch::BatchRunner`] drives it over an uploaded CSV of URLs.

pub mod analyze;
pub mod batch;
pub mod fetch;
pub mod links;
pub mod logs;
pub mod methods;
pub mod normalize;
pub mod persist;
pub mod pipeline;
pub mod selectors;
pub mod session;

pub use pipeline::{AnalyzeOutcome, ApproveOutcome, PipelineDeps, ScrapePipeline, TestOutcome};
