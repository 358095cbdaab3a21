//! The fatal error kinds of the audit engine.
//!
//! Every kind here aborts the current stage; callers attach the offending
//! file path and row via eyre context before surfacing.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// Structure, contests, collections, CVRs or outcomes disagree.
    #[error("model consistency: {detail}")]
    ModelConsistency { detail: String },

    /// A vote uses a selection id that is neither declared nor a write-in.
    #[error("contest {cid}: unknown selection {selid:?}")]
    UnknownSelection { cid: String, selid: String },

    /// Expanding a manifest did not produce the declared number of
    /// distinct ballots.
    #[error("manifest for {pbcid}: {declared} ballots declared but expansion produced {found} distinct")]
    ManifestArithmetic {
        pbcid: String,
        declared: usize,
        found: usize,
    },

    /// An audited-votes transcript skips an entry of the sampling order.
    #[error("audited votes for {pbcid} skip ballot {missing_bid} (sampling-order position {position})")]
    OutOfOrderSample {
        pbcid: String,
        missing_bid: String,
        position: usize,
    },

    /// No version of a required file exists.
    #[error("missing input: no file matching {prefix}*{suffix} under {}", dir.display())]
    MissingInput {
        dir: PathBuf,
        prefix: String,
        suffix: String,
    },

    /// An audit parameter is outside its legal range.
    #[error("parameter out of range: {detail}")]
    ParameterOutOfRange { detail: String },

    /// The audit seed is not a decimal string of at least 20 digits.
    #[error("audit seed must be a decimal string of at least 20 digits")]
    SeedInvalid,

    /// Two distinct input paths hash to the same digest: a duplicate upload.
    #[error("file integrity: {} and {} have identical content", a.display(), b.display())]
    FileIntegrity { a: PathBuf, b: PathBuf },
}

impl AuditError {
    /// Convenience for the most common kind.
    pub fn consistency(detail: impl Into<String>) -> Self {
        AuditError::ModelConsistency {
            detail: detail.into(),
        }
    }

    pub fn parameter(detail: impl Into<String>) -> Self {
        AuditError::ParameterOutOfRange {
            detail: detail.into(),
        }
    }
}
