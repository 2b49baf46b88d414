use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::SsdlError;

/// The lepton flavors entering the dilepton selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flavor {
    /// A muon.
    Muon,
    /// An electron.
    Electron,
}
impl Flavor {
    /// The rest mass in GeV used when building four-vectors.
    pub fn mass(&self) -> f64 {
        match self {
            Flavor::Muon => 0.1057,
            Flavor::Electron => 0.0005,
        }
    }
    /// The same-flavor channel whose control-region counters hold this flavor's ratios.
    pub fn control_channel(&self) -> Channel {
        match self {
            Flavor::Muon => Channel::MuMu,
            Flavor::Electron => Channel::ElEl,
        }
    }
}
impl Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flavor::Muon => write!(f, "Mu"),
            Flavor::Electron => write!(f, "El"),
        }
    }
}
impl FromStr for Flavor {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mu" | "muon" | "m" => Ok(Self::Muon),
            "el" | "e" | "ele" | "electron" => Ok(Self::Electron),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "Flavor".to_string(),
            }),
        }
    }
}

/// A dilepton final state.
///
/// In [`Channel::ElMu`] the muon is always the first leg and the electron the second.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Two muons.
    MuMu,
    /// Two electrons.
    ElEl,
    /// One muon and one electron.
    ElMu,
}
impl Channel {
    /// All channels in reporting order.
    pub const ALL: [Channel; 3] = [Channel::MuMu, Channel::ElMu, Channel::ElEl];

    /// Flavors of the first and second leg.
    pub fn legs(&self) -> (Flavor, Flavor) {
        match self {
            Channel::MuMu => (Flavor::Muon, Flavor::Muon),
            Channel::ElEl => (Flavor::Electron, Flavor::Electron),
            Channel::ElMu => (Flavor::Muon, Flavor::Electron),
        }
    }
    /// Whether both legs share a flavor.
    pub fn is_same_flavor(&self) -> bool {
        !matches!(self, Channel::ElMu)
    }
    /// The data stream whose double-lepton trigger selects this channel.
    pub fn stream(&self) -> Stream {
        match self {
            Channel::MuMu => Stream::DoubleMu,
            Channel::ElEl => Stream::DoubleEle,
            Channel::ElMu => Stream::MuEG,
        }
    }
    /// Short label used in tables.
    pub fn label(&self) -> &'static str {
        match self {
            Channel::MuMu => "Mu/Mu",
            Channel::ElEl => "E/E",
            Channel::ElMu => "E/Mu",
        }
    }
}
impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::MuMu => write!(f, "MuMu"),
            Channel::ElEl => write!(f, "ElEl"),
            Channel::ElMu => write!(f, "ElMu"),
        }
    }
}
impl FromStr for Channel {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mumu" | "mm" | "mu/mu" => Ok(Self::MuMu),
            "elel" | "ee" | "e/e" => Ok(Self::ElEl),
            "elmu" | "emu" | "em" | "e/mu" | "muel" => Ok(Self::ElMu),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "Channel".to_string(),
            }),
        }
    }
}

/// The charge relation demanded of the selected lepton pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeRelation {
    /// Both leptons carry the same charge (signal selection).
    #[default]
    SameSign,
    /// The leptons carry opposite charges (closure and charge misidentification).
    OppositeSign,
}
impl ChargeRelation {
    /// Check a pair of charges against the relation.
    pub fn accepts(&self, q1: i32, q2: i32) -> bool {
        match self {
            ChargeRelation::SameSign => q1 == q2,
            ChargeRelation::OppositeSign => q1 == -q2,
        }
    }
}
impl Display for ChargeRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargeRelation::SameSign => write!(f, "SS"),
            ChargeRelation::OppositeSign => write!(f, "OS"),
        }
    }
}
impl FromStr for ChargeRelation {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ss" | "same" | "same_sign" | "same-sign" => Ok(Self::SameSign),
            "os" | "opposite" | "opposite_sign" | "opposite-sign" => Ok(Self::OppositeSign),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "ChargeRelation".to_string(),
            }),
        }
    }
}

/// The two control regions in which tight/loose ratios are measured.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlRegion {
    /// Single loose lepton in a QCD-enriched selection, measuring the fake ratio `f`.
    FakeRate,
    /// Loose lepton pairs on the Z peak, measuring the prompt ratio `p`.
    PromptRate,
}
impl Display for ControlRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlRegion::FakeRate => write!(f, "fRatio"),
            ControlRegion::PromptRate => write!(f, "pRatio"),
        }
    }
}

/// What kind of events a sample holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Collision data (normalization scale is always one).
    Data,
    /// Standard Model background simulation.
    Background,
    /// Signal simulation.
    Signal,
    /// Rare Standard Model processes.
    Rare,
}
impl SampleKind {
    /// Whether the sample is simulated.
    pub fn is_simulation(&self) -> bool {
        !matches!(self, SampleKind::Data)
    }
    /// The integer code used by the sample list format: 0 data, 1 background, 2 signal, 3 rare.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SampleKind::Data),
            1 => Some(SampleKind::Background),
            2 => Some(SampleKind::Signal),
            3 => Some(SampleKind::Rare),
            _ => None,
        }
    }
}
impl Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleKind::Data => write!(f, "data"),
            SampleKind::Background => write!(f, "background"),
            SampleKind::Signal => write!(f, "signal"),
            SampleKind::Rare => write!(f, "rare"),
        }
    }
}
impl FromStr for SampleKind {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "data" => Ok(Self::Data),
            "1" | "mc" | "bg" | "background" => Ok(Self::Background),
            "2" | "sig" | "signal" => Ok(Self::Signal),
            "3" | "rare" => Ok(Self::Rare),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "SampleKind".to_string(),
            }),
        }
    }
}

/// Primary datasets of collision data, each defined by the trigger paths it was recorded with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    /// Double-muon triggers.
    DoubleMu,
    /// Double-electron triggers.
    DoubleEle,
    /// Muon-electron cross triggers.
    MuEG,
    /// Single-muon triggers (fake-ratio control region).
    SingleMu,
    /// Single-electron triggers (fake-ratio control region).
    SingleEle,
}
impl Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::DoubleMu => write!(f, "DoubleMu"),
            Stream::DoubleEle => write!(f, "DoubleEle"),
            Stream::MuEG => write!(f, "MuEG"),
            Stream::SingleMu => write!(f, "SingleMu"),
            Stream::SingleEle => write!(f, "SingleEle"),
        }
    }
}
impl FromStr for Stream {
    type Err = SsdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "doublemu" | "mumu" => Ok(Self::DoubleMu),
            "doubleele" | "doubleelectron" | "ee" => Ok(Self::DoubleEle),
            "mueg" | "emu" => Ok(Self::MuEG),
            "singlemu" | "mu" => Ok(Self::SingleMu),
            "singleele" | "singleelectron" | "el" => Ok(Self::SingleEle),
            _ => Err(SsdlError::ParseError {
                name: s.to_string(),
                object: "Stream".to_string(),
            }),
        }
    }
}

/// Barrel or endcap part of the electromagnetic calorimeter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorRegion {
    /// `|eta|` below the barrel boundary.
    Barrel,
    /// `|eta|` at or above the barrel boundary.
    Endcap,
}
impl DetectorRegion {
    /// Classify a pseudorapidity against the barrel boundary.
    pub fn from_eta(eta: f64, boundary: f64) -> Self {
        if eta.abs() < boundary {
            DetectorRegion::Barrel
        } else {
            DetectorRegion::Endcap
        }
    }
}
