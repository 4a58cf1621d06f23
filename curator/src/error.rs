//! Failures that terminate a dataset build.

use thiserror::Error;

/// Run-level failures that callers may want to match on.
///
/// Everything else is reported through [anyhow::Error] with context, and
/// per-record or per-task problems never become errors at all.
#[derive(Debug, Error)]
pub enum CurateError {
    /// The taxonomy document is unreadable or structurally invalid.
    #[error("failed to load taxonomy '{origin}': {reason}")]
    TaxonomyLoad { origin: String, reason: String },
    /// Too few classes survived pruning to train a classifier.
    #[error(
        "need at least 2 classes after filtering with min_images_per_class={min_images_per_class}, \
         but found {kept}"
    )]
    InsufficientClasses {
        kept: usize,
        min_images_per_class: usize,
    },
    /// No configured source produced a single crop task.
    #[error("no crop tasks were selected from any source")]
    NoCropTasks,
}
