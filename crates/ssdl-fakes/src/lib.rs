//! # ssdl-fakes
//!
//! This is an internal crate used by `ssdl`. It turns the yields accumulated by `ssdl-core` into
//! tight-to-loose ratios, decomposes pair counts by lepton origin with the matrix method and
//! aggregates the per-sample solutions into per-channel background predictions.
#![warn(clippy::perf, clippy::style)]

/// Linear systems relating prompt/fake origin to the observed tight/loose categories.
pub mod matrix;
/// Per-channel predictions, charge misidentification and closure tests.
pub mod prediction;
/// Tight-to-loose ratios, their uncertainties and binned ratio maps.
pub mod ratio;
/// Fixed-width text tables.
pub mod report;

pub use crate::matrix::{
    BinnedSolution, Estimate, ExcludedBin, FakeRateMatrixSolver, FakeRateSolution, LegMaps,
    LegRatios, ObservedCounts, Topology, TopologySolution,
};
pub use crate::prediction::{
    charge_misid_estimate, ChannelPrediction, CombinedPrediction, FakeRateSet, FlavorMaps,
    FlavorRatios, PredictionAggregator, PredictionInputs, RatioMapSet,
};
pub use crate::ratio::{Ratio, RatioError, RatioEstimator, RatioMap, RatioValue};
pub use crate::report::{CutFlowTable, PredictionTable, RatioTable, Report, YieldTable};
