use serde::{Deserialize, Serialize};
use std::{fmt::Display, sync::Arc};

use crate::{
    utils::{enums::Flavor, vectors::Vec4},
    SsdlResult,
};

/// Event I/O: JSON-lines readers and writers plus path helpers.
pub mod io;

pub use io::{expand_path, write_json_lines, JsonLinesSource};

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

/// A reconstructed lepton candidate.
///
/// Object identification is not decided here: the flags and isolation are raw inputs for a
/// [`LeptonSelector`](crate::classifier::LeptonSelector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lepton {
    pub flavor: Flavor,
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    /// Electric charge in units of e (+1 or -1).
    pub charge: i32,
    /// Relative isolation.
    #[serde(default)]
    pub iso: f64,
    /// Transverse mass of the lepton with the missing transverse momentum.
    #[serde(default)]
    pub mt: f64,
    /// Tight identification working point.
    #[serde(default = "yes")]
    pub tight_id: bool,
    /// Agreement of the independent charge measurements (electrons).
    #[serde(default = "yes")]
    pub charge_consistent: bool,
}

impl Lepton {
    pub fn p4(&self) -> Vec4 {
        Vec4::from_pt_eta_phi_m(self.pt, self.eta, self.phi, self.flavor.mass())
    }
}

impl Display for Lepton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{} (pt = {:.2}, eta = {:.3}, phi = {:.3}, iso = {:.3})",
            self.flavor,
            if self.charge > 0 { "+" } else { "-" },
            self.pt,
            self.eta,
            self.phi,
            self.iso
        )
    }
}

/// A reconstructed jet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Jet {
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
}

/// Trigger decisions recorded for an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default)]
    pub double_mu: bool,
    #[serde(default)]
    pub double_el: bool,
    #[serde(default)]
    pub mu_el: bool,
    #[serde(default)]
    pub single_mu: bool,
    #[serde(default)]
    pub single_el: bool,
    /// Prescale of the fired single-muon path, used as weight in the fake-ratio region.
    #[serde(default = "one")]
    pub single_mu_prescale: f64,
    /// Prescale of the fired single-electron path.
    #[serde(default = "one")]
    pub single_el_prescale: f64,
}

impl Default for Triggers {
    fn default() -> Self {
        Self {
            double_mu: false,
            double_el: false,
            mu_el: false,
            single_mu: false,
            single_el: false,
            single_mu_prescale: 1.0,
            single_el_prescale: 1.0,
        }
    }
}

/// The flat per-event record consumed by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub run: u32,
    #[serde(default)]
    pub event: u64,
    /// Generator or reweighting weight.
    #[serde(default = "one")]
    pub weight: f64,
    /// Pileup weight, multiplied into `weight` for simulation.
    #[serde(default = "one")]
    pub pu_weight: f64,
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default)]
    pub leptons: Vec<Lepton>,
    #[serde(default)]
    pub jets: Vec<Jet>,
    /// Missing transverse energy (particle flow).
    #[serde(default)]
    pub met: f64,
}

impl Default for EventRecord {
    fn default() -> Self {
        Self {
            run: 0,
            event: 0,
            weight: 1.0,
            pu_weight: 1.0,
            triggers: Triggers::default(),
            leptons: Vec::new(),
            jets: Vec::new(),
            met: 0.0,
        }
    }
}

impl Display for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Event {}:{}", self.run, self.event)?;
        writeln!(f, "  weight: {} (pileup {})", self.weight, self.pu_weight)?;
        writeln!(f, "  MET: {:.2}", self.met)?;
        writeln!(f, "  Leptons:")?;
        for lepton in &self.leptons {
            writeln!(f, "    {}", lepton)?;
        }
        writeln!(f, "  Jets:")?;
        for jet in &self.jets {
            writeln!(f, "    pt = {:.2}, eta = {:.3}", jet.pt, jet.eta)?;
        }
        Ok(())
    }
}

/// Anything that can stream [`EventRecord`]s for one sample.
pub trait EventSource: Iterator<Item = SsdlResult<EventRecord>> + Send {}

impl<T> EventSource for T where T: Iterator<Item = SsdlResult<EventRecord>> + Send {}

/// An in-memory event source sharing its events with the sample that owns them.
pub struct VecSource {
    events: Arc<Vec<EventRecord>>,
    cursor: usize,
}

impl VecSource {
    pub fn new(events: Arc<Vec<EventRecord>>) -> Self {
        Self { events, cursor: 0 }
    }
}

impl Iterator for VecSource {
    type Item = SsdlResult<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(Ok(event))
    }
}

/// A lepton which passes the default tight selection.
pub fn test_lepton(flavor: Flavor, pt: f64, eta: f64, phi: f64, charge: i32) -> Lepton {
    Lepton {
        flavor,
        pt,
        eta,
        phi,
        charge,
        iso: 0.05,
        mt: 10.0,
        tight_id: true,
        charge_consistent: true,
    }
}

/// An event that passes the baseline same-sign dimuon selection with both muons tight: two
/// positive muons of 35 and 22 GeV, three jets (HT = 230) and 60 GeV of MET.
pub fn test_event() -> EventRecord {
    EventRecord {
        run: 1,
        event: 42,
        weight: 1.0,
        pu_weight: 1.0,
        triggers: Triggers {
            double_mu: true,
            ..Triggers::default()
        },
        leptons: vec![
            test_lepton(Flavor::Muon, 35.0, 0.4, 0.3, 1),
            test_lepton(Flavor::Muon, 22.0, -1.1, 2.6, 1),
        ],
        jets: vec![
            Jet {
                pt: 110.0,
                eta: 0.9,
                phi: -2.0,
            },
            Jet {
                pt: 80.0,
                eta: -0.2,
                phi: 1.2,
            },
            Jet {
                pt: 40.0,
                eta: 2.0,
                phi: -0.8,
            },
        ],
        met: 60.0,
    }
}
