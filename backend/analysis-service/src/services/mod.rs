//! Analysis business logic

pub mod merger;
pub mod tag_generator;

pub use merger::{
    needs_verification, ConfidenceWeighting, MergeOutcome, MergerConfig, ResultMerger,
    DEFAULT_FACE_IOU_THRESHOLD, DEFAULT_VERIFICATION_THRESHOLD,
};
pub use tag_generator::{normalize_tag, rank_tags, RankedTag, TagCandidate, TagSource};
