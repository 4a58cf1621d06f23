//! Builds class-balanced image-folder datasets from object-detection corpora.
//!
//! The pipeline maps external category labels onto a target taxonomy, plans
//! one crop task per usable bounding box, fetches and crops the boxes
//! concurrently, and finally merges every source into a `train`/`val`/`test`
//! folder tree with a reproducible manifest.

mod common;

pub mod annotation;
pub mod assembler;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod manifest;
pub mod mapper;
pub mod pipeline;
pub mod planner;
pub mod split;
pub mod taxonomy;

pub use error::CurateError;
