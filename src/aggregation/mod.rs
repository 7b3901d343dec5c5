//! Raw-event aggregation.
//!
//! This module turns decoded raw event rows into aggregated heatmap
//! points: composite-key deduplication, divisor smoothing, density
//! accretion under a selectable method, and series grouping.

pub mod aggregator;
pub mod key;
pub mod method;
pub mod smooth;

pub use aggregator::{AggregationOptions, AggregationSummary, HeatmapAggregator};
pub use method::AggregationMethod;
