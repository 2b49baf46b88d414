//! # ssdl-core
//!
//! This is an internal crate used by `ssdl`. It holds the event model, the configuration layer,
//! the sample registry, the per-event classifier and the yield bookkeeping which the fake-rate
//! machinery in `ssdl-fakes` consumes.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// The event classifier which fills signal-region and control-region yields.
pub mod classifier;
/// Analysis configuration: regions, selection constants, binning and sample records.
pub mod config;
/// Flat event records and the sources which provide them.
pub mod data;
/// Sample descriptions and the registry which validates them.
pub mod samples;
/// Utility functions, enums, and histograms
pub mod utils;
/// Counters, histograms and cut flows accumulated per sample, region and channel.
pub mod yields;

pub use crate::classifier::EventClassifier;
pub use crate::config::{AnalysisConfig, Region, SampleRecord};
pub use crate::data::{EventRecord, EventSource, Jet, Lepton};
pub use crate::samples::{Sample, SampleRegistry};
pub use crate::utils::enums::{
    Channel, ChargeRelation, ControlRegion, DetectorRegion, Flavor, SampleKind, Stream,
};
pub use crate::utils::vectors::Vec4;
pub use crate::utils::{BinnedAxis, Hist2D};
pub use crate::yields::{ChannelYields, CutFlow, NumberSet, YieldStore};

pub type SsdlResult<T> = Result<T, SsdlError>;

/// The error type used by all `ssdl` internal methods
#[derive(Error, Debug)]
pub enum SsdlError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An alias for [`toml::de::Error`].
    #[error("TOML Error: {0}")]
    TomlError(#[from] toml::de::Error),
    /// An error returned by a [`statrs`] distribution.
    #[error("Statistics Error: {0}")]
    StatisticsError(#[from] statrs::StatsError),
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// A configuration record which is malformed or inconsistent.
    #[error("Invalid configuration for \"{name}\": {reason}")]
    ConfigError {
        /// The record or key at fault
        name: String,
        /// What is wrong with it
        reason: String,
    },
    /// A ratio was requested with no loose objects in the denominator.
    #[error("Cannot form a {what} ratio: the loose count is zero")]
    ZeroDenominator {
        /// Which ratio was being computed
        what: String,
    },
    /// A ratio map bin without entries was used where a value is required.
    #[error("Undefined {what} ratio at pt = {pt}, eta = {eta}")]
    UndefinedRatio {
        /// Which ratio map was queried
        what: String,
        /// Transverse momentum of the lookup
        pt: f64,
        /// Pseudorapidity of the lookup
        eta: f64,
    },
    /// The tight/loose system cannot be inverted because a leg has equal prompt and fake ratios.
    #[error("Singular tight/loose matrix: leg {leg} has p = {p} and f = {f}")]
    SingularMatrix {
        /// Which lepton leg (1 or 2) is degenerate
        leg: usize,
        /// The prompt ratio of that leg
        p: f64,
        /// The fake ratio of that leg
        f: f64,
    },
    /// A sample whose data source could not be opened or read.
    #[error("Sample \"{name}\" is unavailable: {reason}")]
    SampleUnavailable {
        /// Name of the sample
        name: String,
        /// Why the sample was rejected
        reason: String,
    },
    /// A lookup by name failed.
    #[error("No registered {object} with name \"{name}\"!")]
    NotFound {
        /// The name which failed lookup
        name: String,
        /// The kind of object which was looked up
        object: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

impl Clone for SsdlError {
    // error sources are not cloneable, but excluded bins and samples keep their error around
    fn clone(&self) -> Self {
        match self {
            SsdlError::SingularMatrix { leg, p, f } => SsdlError::SingularMatrix {
                leg: *leg,
                p: *p,
                f: *f,
            },
            SsdlError::UndefinedRatio { what, pt, eta } => SsdlError::UndefinedRatio {
                what: what.clone(),
                pt: *pt,
                eta: *eta,
            },
            SsdlError::SampleUnavailable { name, reason } => SsdlError::SampleUnavailable {
                name: name.clone(),
                reason: reason.clone(),
            },
            other => SsdlError::Custom(other.to_string()),
        }
    }
}
