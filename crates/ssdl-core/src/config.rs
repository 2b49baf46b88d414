use std::{fmt::Display, fs, str::FromStr};

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    data::expand_path,
    utils::{
        enums::{ChargeRelation, Flavor, SampleKind, Stream},
        BinnedAxis,
    },
    SsdlError, SsdlResult,
};

/// Leading and trailing lepton transverse-momentum thresholds per flavor.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeptonPtCuts {
    pub mu1: f64,
    pub mu2: f64,
    pub el1: f64,
    pub el2: f64,
}

impl LeptonPtCuts {
    /// Leading-leg threshold for a flavor.
    pub fn leading(&self, flavor: Flavor) -> f64 {
        match flavor {
            Flavor::Muon => self.mu1,
            Flavor::Electron => self.el1,
        }
    }
    /// Trailing-leg threshold for a flavor.
    pub fn trailing(&self, flavor: Flavor) -> f64 {
        match flavor {
            Flavor::Muon => self.mu2,
            Flavor::Electron => self.el2,
        }
    }
}

/// The two lepton momentum scenarios of the analysis.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PtSelection {
    /// 20/10 GeV for both flavors.
    #[default]
    HighPt,
    /// 5/5 GeV muons and 10/10 GeV electrons, for HT-triggered selections.
    LowPt,
}

impl PtSelection {
    pub fn cuts(&self) -> LeptonPtCuts {
        match self {
            PtSelection::HighPt => LeptonPtCuts {
                mu1: 20.0,
                mu2: 10.0,
                el1: 20.0,
                el2: 10.0,
            },
            PtSelection::LowPt => LeptonPtCuts {
                mu1: 5.0,
                mu2: 5.0,
                el1: 10.0,
                el2: 10.0,
            },
        }
    }
}

impl FromStr for PtSelection {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "highpt" | "high" | "hi" => Ok(Self::HighPt),
            "lowpt" | "low" | "lo" => Ok(Self::LowPt),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "PtSelection".to_string(),
            }),
        }
    }
}

/// A named set of event-level requirements defining a signal region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    /// Overrides the lepton thresholds of the global [`PtSelection`].
    #[serde(default)]
    pub pt_cuts: Option<LeptonPtCuts>,
    #[serde(default)]
    pub min_ht: f64,
    #[serde(default)]
    pub max_ht: Option<f64>,
    #[serde(default)]
    pub min_met: f64,
    #[serde(default)]
    pub max_met: Option<f64>,
    #[serde(default)]
    pub min_jets: usize,
}

impl Region {
    fn preset(name: &str, min_ht: f64, min_met: f64, min_jets: usize) -> Self {
        Self {
            name: name.to_string(),
            pt_cuts: None,
            min_ht,
            max_ht: None,
            min_met,
            max_met: None,
            min_jets,
        }
    }

    /// The region table of the analysis, in reporting order.
    pub fn presets() -> Vec<Region> {
        vec![
            Region::preset("Baseline", 80.0, 30.0, 2),
            Region {
                max_ht: Some(80.0),
                max_met: Some(30.0),
                ..Region::preset("Control", 0.0, 0.0, 0)
            },
            Region::preset("HT80MET100", 80.0, 100.0, 2),
            Region::preset("HT200MET30", 200.0, 30.0, 2),
            Region::preset("HT200MET120", 200.0, 120.0, 2),
            Region::preset("HT400MET50", 400.0, 50.0, 2),
            Region::preset("HT400MET120", 400.0, 120.0, 2),
        ]
    }

    /// Lepton thresholds, falling back to the global scenario.
    pub fn pt_cuts(&self, default: PtSelection) -> LeptonPtCuts {
        self.pt_cuts.unwrap_or_else(|| default.cuts())
    }

    pub fn passes_ht(&self, ht: f64) -> bool {
        ht >= self.min_ht && self.max_ht.map_or(true, |max| ht < max)
    }

    pub fn passes_met(&self, met: f64) -> bool {
        met >= self.min_met && self.max_met.map_or(true, |max| met < max)
    }

    pub fn validate(&self) -> SsdlResult<()> {
        let fail = |reason: String| {
            Err(SsdlError::ConfigError {
                name: self.name.clone(),
                reason,
            })
        };
        if self.name.trim().is_empty() {
            return fail("region name is empty".to_string());
        }
        if self.min_ht < 0.0 || self.min_met < 0.0 {
            return fail("minimum HT and MET must not be negative".to_string());
        }
        if let Some(max) = self.max_ht {
            if max <= self.min_ht {
                return fail(format!("max HT {} <= min HT {}", max, self.min_ht));
            }
        }
        if let Some(max) = self.max_met {
            if max <= self.min_met {
                return fail(format!("max MET {} <= min MET {}", max, self.min_met));
            }
        }
        if let Some(cuts) = self.pt_cuts {
            if cuts.mu1 < cuts.mu2 || cuts.el1 < cuts.el2 {
                return fail("leading pt threshold below trailing threshold".to_string());
            }
        }
        Ok(())
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let upper = |v: Option<f64>| v.map_or("inf".to_string(), |v| format!("{}", v));
        write!(
            f,
            "{:<12} HT [{}, {}) MET [{}, {}) NJ >= {}",
            self.name,
            self.min_ht,
            upper(self.max_ht),
            self.min_met,
            upper(self.max_met),
            self.min_jets
        )
    }
}

/// Event-level selection constants shared by all regions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub z_mass: f64,
    /// Half-width of the Z window used by the veto and the prompt-ratio region.
    pub z_window: f64,
    /// Pairs below this invariant mass are vetoed.
    pub low_mass_veto: f64,
    /// At least one jet above this threshold is required everywhere.
    pub hard_jet_pt: f64,
    /// Jets above this threshold count towards NJets and HT.
    pub jet_pt: f64,
    pub jet_eta: f64,
    /// Jets within this cone of a selected lepton are removed.
    pub jet_lepton_dr: f64,
    pub control_max_met: f64,
    pub control_max_mt: f64,
    /// Minimum number of cleaned jets in the prompt-ratio region.
    pub prompt_min_jets: usize,
    pub barrel_eta: f64,
    /// Charge relation of the predicted pairs. Both passes are always accumulated.
    pub charge: ChargeRelation,
    pub pt_selection: PtSelection,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            z_mass: 91.2,
            z_window: 15.0,
            low_mass_veto: 5.0,
            hard_jet_pt: 50.0,
            jet_pt: 30.0,
            jet_eta: 2.5,
            jet_lepton_dr: 0.4,
            control_max_met: 20.0,
            control_max_mt: 20.0,
            prompt_min_jets: 2,
            barrel_eta: 1.479,
            charge: ChargeRelation::SameSign,
            pt_selection: PtSelection::HighPt,
        }
    }
}

/// Thresholds of the default isolation-based lepton selector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSelection {
    pub mu_max_eta: f64,
    pub mu_loose_iso: f64,
    pub mu_tight_iso: f64,
    pub el_max_eta: f64,
    pub el_loose_iso_barrel: f64,
    pub el_loose_iso_endcap: f64,
    pub el_tight_iso: f64,
}

impl Default for ObjectSelection {
    fn default() -> Self {
        Self {
            mu_max_eta: 2.4,
            mu_loose_iso: 1.0,
            mu_tight_iso: 0.15,
            el_max_eta: 2.4,
            el_loose_iso_barrel: 1.0,
            el_loose_iso_endcap: 0.6,
            el_tight_iso: 0.15,
        }
    }
}

/// Bin edges of ratio maps and pair histograms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    pub pt_edges: Vec<f64>,
    pub eta_edges: Vec<f64>,
    /// Pseudorapidity at which ratio maps are read for pt-only bin pairs.
    pub reference_eta: f64,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            pt_edges: vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
            eta_edges: vec![-2.4, 2.4],
            reference_eta: 0.0,
        }
    }
}

impl BinningConfig {
    pub fn pt_axis(&self) -> SsdlResult<BinnedAxis> {
        BinnedAxis::new(self.pt_edges.clone())
    }
    pub fn eta_axis(&self) -> SsdlResult<BinnedAxis> {
        BinnedAxis::new(self.eta_edges.clone())
    }
}

/// How the statistical uncertainty of a tight/loose ratio is computed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UncertaintyModel {
    /// `sqrt(t (1 - t/l)) / l`
    #[default]
    Binomial,
    /// `sqrt(t^2 (l + t) / l^3)`
    Poisson,
    /// Exact Clopper-Pearson interval at the given confidence level.
    ClopperPearson { confidence_level: f64 },
    /// Central Bayesian interval with a `Beta(alpha, beta)` prior.
    Bayesian {
        confidence_level: f64,
        alpha: f64,
        beta: f64,
    },
}

impl UncertaintyModel {
    /// One-sigma Clopper-Pearson.
    pub fn clopper_pearson() -> Self {
        UncertaintyModel::ClopperPearson {
            confidence_level: 0.683,
        }
    }
    /// One-sigma central interval with a flat prior.
    pub fn bayesian() -> Self {
        UncertaintyModel::Bayesian {
            confidence_level: 0.683,
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl FromStr for UncertaintyModel {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binomial" | "binom" => Ok(Self::Binomial),
            "poisson" | "poiss" => Ok(Self::Poisson),
            "clopper-pearson" | "clopperpearson" | "cp" => Ok(Self::clopper_pearson()),
            "bayesian" | "bayes" => Ok(Self::bayesian()),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "UncertaintyModel".to_string(),
            }),
        }
    }
}

/// How the ratio uncertainties are propagated into the systematic error of a solution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystematicMode {
    /// Shift each ratio by one sigma in turn and add the shifts in quadrature.
    #[default]
    PerParameter,
    /// Shift all ratios up by one sigma at once and take the single resulting shift.
    Combined,
}

/// Absolute systematic uncertainties added in quadrature to the measured ratios.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioSystematics {
    pub mu_f: f64,
    pub mu_p: f64,
    pub el_f: f64,
    pub el_p: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioConfig {
    pub model: UncertaintyModel,
    pub systematic_mode: SystematicMode,
    pub extra_systematics: RatioSystematics,
    /// `|p - f|` below this value makes a leg degenerate.
    pub singular_tolerance: f64,
    /// Value assigned to empty prompt-ratio map bins.
    pub prompt_default: f64,
    pub prompt_default_error: f64,
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            model: UncertaintyModel::Binomial,
            systematic_mode: SystematicMode::PerParameter,
            extra_systematics: RatioSystematics::default(),
            singular_tolerance: 1e-6,
            prompt_default: 1.0,
            prompt_default_error: 0.5,
        }
    }
}

/// Electron charge misidentification probabilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeMisIdConfig {
    pub barrel: f64,
    pub barrel_error: f64,
    pub endcap: f64,
    pub endcap_error: f64,
}

impl Default for ChargeMisIdConfig {
    fn default() -> Self {
        Self {
            barrel: 1.5e-4,
            barrel_error: 0.3e-4,
            endcap: 1.6e-3,
            endcap_error: 0.3e-3,
        }
    }
}

/// Which counts feed the matrix-method solver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    /// Pooled scalar counts with pooled scalar ratios.
    #[default]
    Integrated,
    /// One solve per (pt1, pt2) bin pair with ratios read from the maps.
    Binned,
}

impl FromStr for PredictionMode {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "integrated" | "int" => Ok(Self::Integrated),
            "binned" | "bins" => Ok(Self::Binned),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "PredictionMode".to_string(),
            }),
        }
    }
}

/// The full analysis configuration, usually read from a TOML file.
///
/// Every table is optional and falls back to the standard analysis constants. Malformed or
/// inconsistent region records are logged and skipped; the remaining regions stay usable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Integrated luminosity in pb^-1 that simulation is normalized to.
    pub target_lumi: f64,
    pub selection: SelectionConfig,
    pub objects: ObjectSelection,
    pub binning: BinningConfig,
    pub ratios: RatioConfig,
    pub charge_misid: ChargeMisIdConfig,
    pub prediction: PredictionMode,
    #[serde(deserialize_with = "lenient_regions")]
    pub regions: Vec<Region>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            target_lumi: 1000.0,
            selection: SelectionConfig::default(),
            objects: ObjectSelection::default(),
            binning: BinningConfig::default(),
            ratios: RatioConfig::default(),
            charge_misid: ChargeMisIdConfig::default(),
            prediction: PredictionMode::Integrated,
            regions: Region::presets(),
        }
    }
}

fn lenient_regions<'de, D>(deserializer: D) -> Result<Vec<Region>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<toml::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match value.try_into::<Region>() {
            Ok(region) => match region.validate() {
                Ok(()) => Some(region),
                Err(err) => {
                    warn!("Skipping region #{}: {}", i, err);
                    None
                }
            },
            Err(err) => {
                warn!("Skipping malformed region #{}: {}", i, err);
                None
            }
        })
        .collect())
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> SsdlResult<Self> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(file_path: &str) -> SsdlResult<Self> {
        let text = fs::read_to_string(expand_path(file_path)?)?;
        Self::from_toml_str(&text)
    }

    /// Global consistency checks which cannot be recovered by skipping a record.
    pub fn validate(&self) -> SsdlResult<()> {
        if !self.target_lumi.is_finite() || self.target_lumi <= 0.0 {
            return Err(SsdlError::ConfigError {
                name: "target_lumi".to_string(),
                reason: format!("must be positive, got {}", self.target_lumi),
            });
        }
        self.binning.pt_axis()?;
        self.binning.eta_axis()?;
        if self.regions.is_empty() {
            return Err(SsdlError::ConfigError {
                name: "regions".to_string(),
                reason: "no usable region is defined".to_string(),
            });
        }
        Ok(())
    }

    pub fn region(&self, name: &str) -> SsdlResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| SsdlError::NotFound {
                name: name.to_string(),
                object: "region".to_string(),
            })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KindField {
    Code(i32),
    Name(String),
}

/// One entry of the sample list: name, short name, data source, luminosity, kind and color.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub name: String,
    pub sname: String,
    /// Path of the event file; `~` and environment variables are expanded.
    pub file: String,
    /// Integrated luminosity of the sample in pb^-1 (ignored for data).
    #[serde(default)]
    pub lumi: f64,
    #[serde(deserialize_with = "sample_kind")]
    pub kind: SampleKind,
    /// The primary dataset of a data sample.
    #[serde(default)]
    pub stream: Option<Stream>,
    #[serde(default)]
    pub color: i32,
}

fn sample_kind<'de, D>(deserializer: D) -> Result<SampleKind, D::Error>
where
    D: Deserializer<'de>,
{
    match KindField::deserialize(deserializer)? {
        KindField::Code(code) => SampleKind::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown sample kind {}", code))),
        KindField::Name(name) => SampleKind::from_str(&name).map_err(serde::de::Error::custom),
    }
}

impl SampleRecord {
    pub fn validate(&self) -> SsdlResult<()> {
        if self.name.trim().is_empty() || self.sname.trim().is_empty() {
            return Err(SsdlError::ConfigError {
                name: self.name.clone(),
                reason: "sample name and short name are required".to_string(),
            });
        }
        if self.kind.is_simulation() && (!self.lumi.is_finite() || self.lumi <= 0.0) {
            return Err(SsdlError::ConfigError {
                name: self.name.clone(),
                reason: format!("simulated sample needs a positive lumi, got {}", self.lumi),
            });
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct SampleList {
    #[serde(default)]
    sample: Vec<toml::Value>,
}

/// Parse a TOML sample list made of `[[sample]]` tables.
///
/// Records which fail to parse or validate are logged and skipped.
pub fn parse_sample_list(text: &str) -> SsdlResult<Vec<SampleRecord>> {
    let list: SampleList = toml::from_str(text)?;
    Ok(list
        .sample
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| {
            let record = value
                .try_into::<SampleRecord>()
                .map_err(SsdlError::from)
                .and_then(|record| record.validate().map(|_| record));
            match record {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("Skipping sample record #{}: {}", i, err);
                    None
                }
            }
        })
        .collect())
}

pub fn load_sample_list(file_path: &str) -> SsdlResult<Vec<SampleRecord>> {
    let text = fs::read_to_string(expand_path(file_path)?)?;
    parse_sample_list(&text)
}
