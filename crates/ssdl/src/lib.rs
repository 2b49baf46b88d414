//! `ssdl` estimates the fake-lepton background of same-sign dilepton searches from data.
//!
//! Leptons which are not prompt (from heavy-flavor decays, misidentified jets and so on) pass
//! a loose selection much more often than a tight one. Measuring the tight-to-loose ratio for
//! prompt leptons (`p`, from Z decays) and for fakes (`f`, from a QCD-enriched single-lepton
//! sample) turns the counts of loose pairs by tightness category into a linear system whose
//! solution is the number of pairs of each origin. Projecting that solution back into the
//! tight-tight category gives the expected number of signal-region pairs with at least one
//! fake lepton, with statistical and systematic uncertainties kept separate.
//!
//! # Workflow
//! The analysis runs in two phases:
//!
//! 1. **Accumulation.** Every sample is read once per charge relation and each event is
//!    classified into signal-region categories (`Nt2`, `Nt10`, `Nt01`, `Nt0`) and control-region
//!    counters for every configured [`Region`] and [`Channel`]. The result is a pair of
//!    [`YieldStore`]s which can be written to disk.
//! 2. **Prediction.** Ratios are pooled over the control regions, each sample's pair counts are
//!    decomposed with the [`FakeRateMatrixSolver`], and the scaled solutions are summed per
//!    channel together with the expected charge misidentification.
//!
//! ```rust,no_run
//! use ssdl::{Analysis, SsdlResult};
//!
//! fn main() -> SsdlResult<()> {
//!     let mut analysis = Analysis::from_files(Some("analysis.toml"), "samples.toml")?;
//!     let yields = analysis.accumulate()?;
//!     yields.save("yields.json")?;
//!     println!("{}", analysis.report(&yields, "Baseline", true, false)?);
//!     Ok(())
//! }
//! ```
//!
//! # Input format
//! Events are read from JSON-lines files, one [`EventRecord`] per line, with the lepton and jet
//! collections already reconstructed. The sample list is a TOML file of `[[sample]]` tables
//! giving the name, short name, file, luminosity and kind of every sample.
#![warn(clippy::perf, clippy::style)]

/// Orchestration of the accumulation and prediction phases.
pub mod analysis;

/// Event records and the sources which provide them.
pub mod data {
    pub use ssdl_core::data::*;
}
/// Configuration of regions, selections, binning and samples.
pub mod config {
    pub use ssdl_core::config::*;
}
/// Utility functions, enums, and histograms
pub mod utils {
    pub use ssdl_core::utils::*;
}
/// Tight-to-loose ratios, the matrix method and background predictions.
pub mod fakes {
    pub use ssdl_fakes::*;
}

pub use crate::analysis::{Analysis, AnalysisYields};
pub use ssdl_core::classifier::{EventClassifier, IsolationSelector, LeptonSelector};
pub use ssdl_core::samples::{ExcludedSample, Sample, SampleRegistry, SourceLocator};
pub use ssdl_core::yields::{
    ChannelYields, CutFlow, DetectorSplit, NumberSet, YieldHistograms, YieldStore,
};
pub use ssdl_core::{
    AnalysisConfig, BinnedAxis, Channel, ChargeRelation, ControlRegion, DetectorRegion,
    EventRecord, Flavor, Hist2D, Jet, Lepton, Region, SampleKind, SsdlError, SsdlResult, Stream,
    Vec4,
};
pub use ssdl_fakes::*;
