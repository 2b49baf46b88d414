use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
};

use auto_ops::impl_op_ex;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    data::expand_path,
    utils::{
        enums::{Channel, ChargeRelation, ControlRegion, DetectorRegion},
        BinnedAxis, Hist2D,
    },
    SsdlResult,
};

/// Weighted event counts for one sample, region and channel.
///
/// `nt2`, `nt10`, `nt01` and `nt0` count selected pairs with two, one or no tight leptons. In
/// same-flavor channels every one-tight pair goes to `nt10`; in [`Channel::ElMu`] `nt10` has a
/// tight muon and `nt01` a tight electron. `nsst`/`nssl` are the tight/loose counts of the
/// fake-ratio control region and `nzt`/`nzl` those of the prompt-ratio region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberSet {
    pub nt2: f64,
    pub nt10: f64,
    pub nt01: f64,
    pub nt0: f64,
    pub nsst: f64,
    pub nssl: f64,
    pub nzt: f64,
    pub nzl: f64,
}

impl NumberSet {
    /// Every counter multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            nt2: self.nt2 * factor,
            nt10: self.nt10 * factor,
            nt01: self.nt01 * factor,
            nt0: self.nt0 * factor,
            nsst: self.nsst * factor,
            nssl: self.nssl * factor,
            nzt: self.nzt * factor,
            nzl: self.nzl * factor,
        }
    }

    /// Tight and loose counts of a control region.
    pub fn control(&self, region: ControlRegion) -> (f64, f64) {
        match region {
            ControlRegion::FakeRate => (self.nsst, self.nssl),
            ControlRegion::PromptRate => (self.nzt, self.nzl),
        }
    }

    /// All selected signal-region pairs.
    pub fn n_pairs(&self) -> f64 {
        self.nt2 + self.nt10 + self.nt01 + self.nt0
    }
}

impl_op_ex!(+ |a: &NumberSet, b: &NumberSet| -> NumberSet {
    NumberSet {
        nt2: a.nt2 + b.nt2,
        nt10: a.nt10 + b.nt10,
        nt01: a.nt01 + b.nt01,
        nt0: a.nt0 + b.nt0,
        nsst: a.nsst + b.nsst,
        nssl: a.nssl + b.nssl,
        nzt: a.nzt + b.nzt,
        nzl: a.nzl + b.nzl,
    }
});

/// Tight-tight pairs split by the calorimeter regions of their electrons.
///
/// Dielectron pairs fill barrel-barrel, barrel-endcap or endcap-endcap. Electron-muon pairs fill
/// `bb` for a barrel electron and `ee` for an endcap electron. Dimuon pairs are not split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorSplit {
    pub bb: f64,
    pub eb: f64,
    pub ee: f64,
}

impl DetectorSplit {
    pub fn fill(&mut self, first: DetectorRegion, second: DetectorRegion, weight: f64) {
        match (first, second) {
            (DetectorRegion::Barrel, DetectorRegion::Barrel) => self.bb += weight,
            (DetectorRegion::Endcap, DetectorRegion::Endcap) => self.ee += weight,
            _ => self.eb += weight,
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            bb: self.bb * factor,
            eb: self.eb * factor,
            ee: self.ee * factor,
        }
    }
}

impl_op_ex!(+ |a: &DetectorSplit, b: &DetectorSplit| -> DetectorSplit {
    DetectorSplit {
        bb: a.bb + b.bb,
        eb: a.eb + b.eb,
        ee: a.ee + b.ee,
    }
});

/// An ordered list of named selection steps with the weighted count passing each.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CutFlow(IndexMap<String, f64>);

impl CutFlow {
    pub fn fill(&mut self, step: &str, weight: f64) {
        *self.0.entry(step.to_string()).or_insert(0.0) += weight;
    }

    pub fn get(&self, step: &str) -> f64 {
        self.0.get(step).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl_op_ex!(+ |a: &CutFlow, b: &CutFlow| -> CutFlow {
    let mut out = a.clone();
    for (step, weight) in b.iter() {
        out.fill(step, weight);
    }
    out
});

/// Binned counterparts of a [`NumberSet`].
///
/// Pair histograms are binned in (pt of leg 1, pt of leg 2); for same-flavor one-tight pairs the
/// tight lepton is on the x axis. Control-region histograms are binned in (pt, eta).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct YieldHistograms {
    pub nt2: Hist2D,
    pub nt10: Hist2D,
    pub nt01: Hist2D,
    pub nt0: Hist2D,
    pub fake_tight: Hist2D,
    pub fake_loose: Hist2D,
    pub prompt_tight: Hist2D,
    pub prompt_loose: Hist2D,
}

impl YieldHistograms {
    pub fn new(pt: &BinnedAxis, eta: &BinnedAxis) -> Self {
        let pair = Hist2D::new(pt.clone(), pt.clone());
        let map = Hist2D::new(pt.clone(), eta.clone());
        Self {
            nt2: pair.clone(),
            nt10: pair.clone(),
            nt01: pair.clone(),
            nt0: pair,
            fake_tight: map.clone(),
            fake_loose: map.clone(),
            prompt_tight: map.clone(),
            prompt_loose: map,
        }
    }

    /// Tight and loose maps of a control region.
    pub fn control(&self, region: ControlRegion) -> (&Hist2D, &Hist2D) {
        match region {
            ControlRegion::FakeRate => (&self.fake_tight, &self.fake_loose),
            ControlRegion::PromptRate => (&self.prompt_tight, &self.prompt_loose),
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            nt2: self.nt2.scaled(factor),
            nt10: self.nt10.scaled(factor),
            nt01: self.nt01.scaled(factor),
            nt0: self.nt0.scaled(factor),
            fake_tight: self.fake_tight.scaled(factor),
            fake_loose: self.fake_loose.scaled(factor),
            prompt_tight: self.prompt_tight.scaled(factor),
            prompt_loose: self.prompt_loose.scaled(factor),
        }
    }
}

impl_op_ex!(+ |a: &YieldHistograms, b: &YieldHistograms| -> YieldHistograms {
    YieldHistograms {
        nt2: &a.nt2 + &b.nt2,
        nt10: &a.nt10 + &b.nt10,
        nt01: &a.nt01 + &b.nt01,
        nt0: &a.nt0 + &b.nt0,
        fake_tight: &a.fake_tight + &b.fake_tight,
        fake_loose: &a.fake_loose + &b.fake_loose,
        prompt_tight: &a.prompt_tight + &b.prompt_tight,
        prompt_loose: &a.prompt_loose + &b.prompt_loose,
    }
});

/// Everything accumulated for one sample, region and channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelYields {
    pub numbers: NumberSet,
    pub split: DetectorSplit,
    pub histograms: YieldHistograms,
    pub cutflow: CutFlow,
}

impl ChannelYields {
    pub fn new(pt: &BinnedAxis, eta: &BinnedAxis) -> Self {
        Self {
            numbers: NumberSet::default(),
            split: DetectorSplit::default(),
            histograms: YieldHistograms::new(pt, eta),
            cutflow: CutFlow::default(),
        }
    }

    /// Counters and histograms multiplied by `factor`. The cut flow stays unweighted by the
    /// sample normalization.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            numbers: self.numbers.scaled(factor),
            split: self.split.scaled(factor),
            histograms: self.histograms.scaled(factor),
            cutflow: self.cutflow.clone(),
        }
    }
}

impl_op_ex!(+ |a: &ChannelYields, b: &ChannelYields| -> ChannelYields {
    ChannelYields {
        numbers: a.numbers + b.numbers,
        split: a.split + b.split,
        histograms: &a.histograms + &b.histograms,
        cutflow: &a.cutflow + &b.cutflow,
    }
});

type RegionMap = IndexMap<String, IndexMap<Channel, ChannelYields>>;

/// The results of the accumulation phase, keyed by sample short name, region name and channel.
///
/// A store is filled under one [`ChargeRelation`]; same-sign and opposite-sign passes live in
/// separate stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct YieldStore {
    charge: ChargeRelation,
    pt_axis: BinnedAxis,
    eta_axis: BinnedAxis,
    samples: IndexMap<String, RegionMap>,
}

impl YieldStore {
    pub fn new(charge: ChargeRelation, pt_axis: BinnedAxis, eta_axis: BinnedAxis) -> Self {
        Self {
            charge,
            pt_axis,
            eta_axis,
            samples: IndexMap::new(),
        }
    }

    pub fn charge(&self) -> ChargeRelation {
        self.charge
    }

    pub fn pt_axis(&self) -> &BinnedAxis {
        &self.pt_axis
    }

    pub fn eta_axis(&self) -> &BinnedAxis {
        &self.eta_axis
    }

    /// Mutable access, creating empty yields on first use.
    pub fn entry(&mut self, sample: &str, region: &str, channel: Channel) -> &mut ChannelYields {
        let (pt, eta) = (&self.pt_axis, &self.eta_axis);
        self.samples
            .entry(sample.to_string())
            .or_default()
            .entry(region.to_string())
            .or_default()
            .entry(channel)
            .or_insert_with(|| ChannelYields::new(pt, eta))
    }

    pub fn get(&self, sample: &str, region: &str, channel: Channel) -> Option<&ChannelYields> {
        self.samples.get(sample)?.get(region)?.get(&channel)
    }

    /// The counters of a key, all zero when nothing was recorded for it.
    pub fn numbers(&self, sample: &str, region: &str, channel: Channel) -> NumberSet {
        self.get(sample, region, channel)
            .map(|y| y.numbers)
            .unwrap_or_default()
    }

    pub fn sample_names(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(String::as_str)
    }

    pub fn contains_sample(&self, sample: &str) -> bool {
        self.samples.contains_key(sample)
    }

    /// Drop a sample, e.g. after its source failed part-way through.
    pub fn remove_sample(&mut self, sample: &str) {
        self.samples.shift_remove(sample);
    }

    pub fn to_json_string(&self) -> SsdlResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(text: &str) -> SsdlResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, file_path: &str) -> SsdlResult<()> {
        let mut writer = BufWriter::new(File::create(expand_path(file_path)?)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(file_path: &str) -> SsdlResult<Self> {
        let reader = BufReader::new(File::open(expand_path(file_path)?)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl_op_ex!(+ |a: &YieldStore, b: &YieldStore| -> YieldStore {
    debug_assert_eq!(a.charge, b.charge, "stores of different charge passes cannot be merged");
    let mut out = a.clone();
    for (sample, regions) in &b.samples {
        for (region, channels) in regions {
            for (channel, yields) in channels {
                let slot = out.entry(sample, region, *channel);
                *slot = &*slot + yields;
            }
        }
    }
    out
});

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axes() -> (BinnedAxis, BinnedAxis) {
        (
            BinnedAxis::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]).unwrap(),
            BinnedAxis::new(vec![-2.4, 2.4]).unwrap(),
        )
    }

    fn store() -> YieldStore {
        let (pt, eta) = axes();
        YieldStore::new(ChargeRelation::SameSign, pt, eta)
    }

    fn awkward() -> NumberSet {
        NumberSet {
            nt2: 0.1 + 0.2,
            nt10: 1.0 / 3.0,
            nt01: 2.0e-17,
            nt0: 123456.789,
            nsst: 17.0 * 0.7,
            nssl: std::f64::consts::PI,
            nzt: 1e300,
            nzl: 5.0,
        }
    }

    #[test]
    fn test_number_set_addition_and_scaling() {
        let a = awkward();
        let sum = a + a.scaled(2.0);
        assert_relative_eq!(sum.nt0, 3.0 * 123456.789);
        assert_relative_eq!(sum.nssl, 3.0 * std::f64::consts::PI);
        assert_eq!(a.control(ControlRegion::PromptRate), (1e300, 5.0));
        assert_relative_eq!(NumberSet::default().n_pairs(), 0.0);
    }

    #[test]
    fn test_entry_creates_and_reads_back() {
        let mut store = store();
        store.entry("TTbar", "Baseline", Channel::ElMu).numbers.nt01 += 2.5;
        assert_relative_eq!(store.numbers("TTbar", "Baseline", Channel::ElMu).nt01, 2.5);
        assert_relative_eq!(store.numbers("TTbar", "Baseline", Channel::MuMu).nt01, 0.0);
        assert!(store.get("WJets", "Baseline", Channel::ElMu).is_none());
    }

    #[test]
    fn test_store_roundtrips_exactly() {
        let mut store = store();
        {
            let yields = store.entry("DoubleMu", "HT400MET120", Channel::MuMu);
            yields.numbers = awkward();
            yields.split.fill(DetectorRegion::Barrel, DetectorRegion::Endcap, 0.3);
            yields.histograms.nt10.fill(25.0, 12.0, 1.0 / 7.0);
            yields.cutflow.fill("All events", 11.0);
            yields.cutflow.fill("passes triggers", 9.0);
        }
        store.entry("TTbar", "Baseline", Channel::ElEl).numbers.nzl = 0.1 * 3.0;
        let text = store.to_json_string().unwrap();
        let back = YieldStore::from_json_str(&text).unwrap();
        assert_eq!(back, store);
        let numbers = back.numbers("DoubleMu", "HT400MET120", Channel::MuMu);
        assert_eq!(numbers.nt2.to_bits(), (0.1_f64 + 0.2).to_bits());
        assert_eq!(numbers.nt10.to_bits(), (1.0_f64 / 3.0).to_bits());
        let flow: Vec<_> = back
            .get("DoubleMu", "HT400MET120", Channel::MuMu)
            .unwrap()
            .cutflow
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(flow, vec!["All events", "passes triggers"]);
    }

    #[test]
    fn test_store_save_and_load() {
        let mut store = store();
        store.entry("A", "Baseline", Channel::MuMu).numbers = awkward();
        let path = std::env::temp_dir().join(format!("ssdl-store-{}.json", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        store.save(&path_str).unwrap();
        assert_eq!(YieldStore::load(&path_str).unwrap(), store);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_store_merge_adds_overlaps() {
        let mut a = store();
        let mut b = store();
        a.entry("S1", "Baseline", Channel::MuMu).numbers.nt2 = 1.0;
        b.entry("S1", "Baseline", Channel::MuMu).numbers.nt2 = 2.0;
        b.entry("S2", "Baseline", Channel::ElEl).numbers.nt0 = 4.0;
        b.entry("S1", "Baseline", Channel::MuMu)
            .cutflow
            .fill("All events", 1.0);
        let merged = &a + &b;
        assert_relative_eq!(merged.numbers("S1", "Baseline", Channel::MuMu).nt2, 3.0);
        assert_relative_eq!(merged.numbers("S2", "Baseline", Channel::ElEl).nt0, 4.0);
        assert_eq!(merged.sample_names().collect::<Vec<_>>(), vec!["S1", "S2"]);
    }

    #[test]
    fn test_detector_split() {
        let mut split = DetectorSplit::default();
        split.fill(DetectorRegion::Barrel, DetectorRegion::Barrel, 1.0);
        split.fill(DetectorRegion::Endcap, DetectorRegion::Barrel, 2.0);
        split.fill(DetectorRegion::Endcap, DetectorRegion::Endcap, 3.0);
        let doubled = split + split;
        assert_relative_eq!(doubled.bb, 2.0);
        assert_relative_eq!(doubled.eb, 4.0);
        assert_relative_eq!(doubled.scaled(0.5).ee, 3.0);
    }
}
