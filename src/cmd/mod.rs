//! Command-line entry points.

pub mod hocr;
pub mod schema;
pub mod worker;
