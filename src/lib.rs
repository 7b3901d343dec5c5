pub mod aggregation;
pub mod output;
pub mod raw;
