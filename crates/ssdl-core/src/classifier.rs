use log::{debug, info, warn};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    config::{AnalysisConfig, LeptonPtCuts, ObjectSelection, Region},
    data::{EventRecord, Lepton},
    samples::{ExcludedSample, Sample},
    utils::{
        enums::{Channel, ChargeRelation, DetectorRegion, Flavor, Stream},
        vectors::delta_r,
    },
    yields::{ChannelYields, YieldStore},
    SsdlResult,
};

/// Cut-flow step names, in the order the signal selection applies them.
pub mod steps {
    pub const ALL: &str = "All events";
    pub const TRIGGER: &str = " ... passes triggers";
    pub const HARD_JET: &str = " ... has one jet > 50 GeV";
    pub const NJETS: &str = " ... passes NJets cut";
    pub const HT: &str = " ... passes HT cut";
    pub const MET: &str = " ... passes MET cut";
    pub const LOOSE: &str = " ... has 2 loose leptons";
    pub const Z_VETO: &str = " ... passes Z veto";
    pub const MINV_VETO: &str = " ... passes Minv veto";
    pub const SAME_SIGN: &str = " ... has same-sign pair";
    pub const OPPOSITE_SIGN: &str = " ... has opposite-sign pair";
    pub const PT_CUTS: &str = " ... passes pt cuts";
    pub const TIGHT_TIGHT: &str = " ... both leptons tight";
}

/// Loose and tight lepton identification.
///
/// Tight leptons are always a subset of loose leptons: the classifier only asks [`is_tight`]
/// for leptons which already passed [`is_loose`].
///
/// [`is_tight`]: LeptonSelector::is_tight
/// [`is_loose`]: LeptonSelector::is_loose
pub trait LeptonSelector: Send + Sync {
    fn is_loose(&self, lepton: &Lepton) -> bool;
    fn is_tight(&self, lepton: &Lepton) -> bool;
}

/// Identification by acceptance, relative isolation and the identification flags.
#[derive(Clone, Debug)]
pub struct IsolationSelector {
    objects: ObjectSelection,
    barrel_eta: f64,
}

impl IsolationSelector {
    pub fn new(objects: ObjectSelection, barrel_eta: f64) -> Self {
        Self {
            objects,
            barrel_eta,
        }
    }
}

impl LeptonSelector for IsolationSelector {
    fn is_loose(&self, lepton: &Lepton) -> bool {
        match lepton.flavor {
            Flavor::Muon => {
                lepton.eta.abs() <= self.objects.mu_max_eta
                    && lepton.iso <= self.objects.mu_loose_iso
            }
            Flavor::Electron => {
                let iso_cut = match DetectorRegion::from_eta(lepton.eta, self.barrel_eta) {
                    DetectorRegion::Barrel => self.objects.el_loose_iso_barrel,
                    DetectorRegion::Endcap => self.objects.el_loose_iso_endcap,
                };
                lepton.eta.abs() <= self.objects.el_max_eta
                    && lepton.charge_consistent
                    && lepton.iso <= iso_cut
            }
        }
    }

    fn is_tight(&self, lepton: &Lepton) -> bool {
        let iso_cut = match lepton.flavor {
            Flavor::Muon => self.objects.mu_tight_iso,
            Flavor::Electron => self.objects.el_tight_iso,
        };
        lepton.tight_id && lepton.iso <= iso_cut
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate<'e> {
    lepton: &'e Lepton,
    tight: bool,
}

impl Candidate<'_> {
    fn flavor(&self) -> Flavor {
        self.lepton.flavor
    }
    fn pt(&self) -> f64 {
        self.lepton.pt
    }
}

/// The per-region interpretation of one event: selected leptons and cleaned jets.
struct EventView<'e> {
    event: &'e EventRecord,
    weight: f64,
    /// Loose leptons above the trailing threshold of their flavor, hardest first.
    loose: Vec<Candidate<'e>>,
    n_jets: usize,
    ht: f64,
    has_hard_jet: bool,
    n_jets_loose_clean: usize,
}

impl<'e> EventView<'e> {
    fn new(
        event: &'e EventRecord,
        weight: f64,
        cuts: &LeptonPtCuts,
        selector: &dyn LeptonSelector,
        config: &AnalysisConfig,
    ) -> Self {
        let sel = &config.selection;
        let mut loose: Vec<Candidate> = event
            .leptons
            .iter()
            .filter(|l| l.pt >= cuts.trailing(l.flavor) && selector.is_loose(l))
            .map(|l| Candidate {
                lepton: l,
                tight: selector.is_tight(l),
            })
            .collect();
        loose.sort_by(|a, b| b.pt().total_cmp(&a.pt()));
        let isolated = |jet_eta: f64, jet_phi: f64, tight_only: bool| {
            loose
                .iter()
                .filter(|c| !tight_only || c.tight)
                .all(|c| delta_r(c.lepton.eta, c.lepton.phi, jet_eta, jet_phi) > sel.jet_lepton_dr)
        };
        let mut n_jets = 0;
        let mut n_jets_loose_clean = 0;
        let mut ht = 0.0;
        let mut has_hard_jet = false;
        for jet in event
            .jets
            .iter()
            .filter(|j| j.pt >= sel.jet_pt && j.eta.abs() <= sel.jet_eta)
        {
            if isolated(jet.eta, jet.phi, true) {
                n_jets += 1;
                ht += jet.pt;
                has_hard_jet |= jet.pt > sel.hard_jet_pt;
            }
            if isolated(jet.eta, jet.phi, false) {
                n_jets_loose_clean += 1;
            }
        }
        Self {
            event,
            weight,
            loose,
            n_jets,
            ht,
            has_hard_jet,
            n_jets_loose_clean,
        }
    }

    fn count_loose(&self, flavor: Flavor) -> usize {
        self.loose.iter().filter(|c| c.flavor() == flavor).count()
    }

    fn has_loose_pair_for(&self, channel: Channel) -> bool {
        match channel {
            Channel::MuMu => self.count_loose(Flavor::Muon) >= 2,
            Channel::ElEl => self.count_loose(Flavor::Electron) >= 2,
            Channel::ElMu => {
                self.count_loose(Flavor::Muon) >= 1 && self.count_loose(Flavor::Electron) >= 1
            }
        }
    }

    /// Any pair of same-flavor tight leptons satisfying `test` on its invariant mass and charges.
    fn any_tight_pair(&self, test: impl Fn(f64, i32, i32) -> bool) -> bool {
        let tight: Vec<&Candidate> = self.loose.iter().filter(|c| c.tight).collect();
        tight.iter().enumerate().any(|(i, a)| {
            tight[i + 1..].iter().any(|b| {
                a.flavor() == b.flavor()
                    && test(
                        (a.lepton.p4() + b.lepton.p4()).m(),
                        a.lepton.charge,
                        b.lepton.charge,
                    )
            })
        })
    }

    /// The lepton pair of the event under the given charge relation.
    ///
    /// Same-sign: the two hardest leptons of each charge form a candidate and the candidate with
    /// the larger scalar pt sum wins. Opposite-sign: the hardest lepton and the hardest lepton of
    /// opposite charge. The pair is ordered by pt, except that a muon always comes first in a
    /// mixed-flavor pair.
    fn select_pair(&self, charge: ChargeRelation) -> Option<(Candidate<'e>, Candidate<'e>)> {
        let pair = match charge {
            ChargeRelation::SameSign => [1, -1]
                .iter()
                .filter_map(|&q| {
                    let mut same = self.loose.iter().filter(|c| c.lepton.charge == q);
                    Some((*same.next()?, *same.next()?))
                })
                .max_by(|a, b| (a.0.pt() + a.1.pt()).total_cmp(&(b.0.pt() + b.1.pt())))?,
            ChargeRelation::OppositeSign => {
                let first = *self.loose.first()?;
                let second = *self.loose[1..]
                    .iter()
                    .find(|c| charge.accepts(first.lepton.charge, c.lepton.charge))?;
                (first, second)
            }
        };
        if pair.0.flavor() == Flavor::Electron && pair.1.flavor() == Flavor::Muon {
            Some((pair.1, pair.0))
        } else {
            Some(pair)
        }
    }
}

fn pair_channel(first: Flavor, second: Flavor) -> Channel {
    match (first, second) {
        (Flavor::Muon, Flavor::Muon) => Channel::MuMu,
        (Flavor::Electron, Flavor::Electron) => Channel::ElEl,
        _ => Channel::ElMu,
    }
}

/// Fills a [`YieldStore`] from events, one region and channel at a time.
///
/// Every event is tested against every configured region. Within a region it can enter at most
/// one signal channel (the channel of its selected lepton pair) and, independently, the
/// fake-ratio and prompt-ratio control regions of each flavor.
pub struct EventClassifier {
    config: AnalysisConfig,
    selector: Box<dyn LeptonSelector>,
}

impl EventClassifier {
    pub fn new(config: AnalysisConfig, selector: Box<dyn LeptonSelector>) -> Self {
        Self { config, selector }
    }

    /// A classifier using the [`IsolationSelector`] built from the configuration.
    pub fn with_default_selector(config: AnalysisConfig) -> Self {
        let selector =
            IsolationSelector::new(config.objects.clone(), config.selection.barrel_eta);
        Self::new(config, Box::new(selector))
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    fn event_weight(&self, event: &EventRecord, sample: &Sample) -> f64 {
        if sample.kind.is_simulation() {
            event.weight * event.pu_weight
        } else {
            event.weight
        }
    }

    fn fires(&self, event: &EventRecord, sample: &Sample, stream: Stream) -> bool {
        let t = &event.triggers;
        let fired = match stream {
            Stream::DoubleMu => t.double_mu,
            Stream::DoubleEle => t.double_el,
            Stream::MuEG => t.mu_el,
            Stream::SingleMu => t.single_mu,
            Stream::SingleEle => t.single_el,
        };
        fired && sample.accepts_stream(stream)
    }

    /// Classify one event of `sample` into `store` under the store's charge relation.
    pub fn classify(&self, event: &EventRecord, sample: &Sample, store: &mut YieldStore) {
        let weight = self.event_weight(event, sample);
        let charge = store.charge();
        for region in &self.config.regions {
            let cuts = region.pt_cuts(self.config.selection.pt_selection);
            let view = EventView::new(event, weight, &cuts, self.selector.as_ref(), &self.config);
            for channel in Channel::ALL {
                let yields = store.entry(&sample.sname, &region.name, channel);
                self.fill_signal(&view, sample, region, &cuts, channel, charge, yields);
            }
            for flavor in [Flavor::Muon, Flavor::Electron] {
                let yields = store.entry(&sample.sname, &region.name, flavor.control_channel());
                self.fill_fake_control(&view, sample, flavor, yields);
                self.fill_prompt_control(&view, sample, flavor, yields);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_signal(
        &self,
        view: &EventView,
        sample: &Sample,
        region: &Region,
        cuts: &LeptonPtCuts,
        channel: Channel,
        charge: ChargeRelation,
        yields: &mut ChannelYields,
    ) {
        let sel = &self.config.selection;
        let w = view.weight;
        let flow = &mut yields.cutflow;
        flow.fill(steps::ALL, w);
        if !self.fires(view.event, sample, channel.stream()) {
            return;
        }
        flow.fill(steps::TRIGGER, w);
        if !view.has_hard_jet {
            return;
        }
        flow.fill(steps::HARD_JET, w);
        if view.n_jets < region.min_jets {
            return;
        }
        flow.fill(steps::NJETS, w);
        if !region.passes_ht(view.ht) {
            return;
        }
        flow.fill(steps::HT, w);
        if !region.passes_met(view.event.met) {
            return;
        }
        flow.fill(steps::MET, w);
        if !view.has_loose_pair_for(channel) {
            return;
        }
        flow.fill(steps::LOOSE, w);
        if view.any_tight_pair(|m, q1, q2| q1 != q2 && (m - sel.z_mass).abs() < sel.z_window) {
            return;
        }
        flow.fill(steps::Z_VETO, w);
        if view.any_tight_pair(|m, _, _| m < sel.low_mass_veto) {
            return;
        }
        flow.fill(steps::MINV_VETO, w);
        let Some((leg1, leg2)) = view.select_pair(charge) else {
            return;
        };
        if pair_channel(leg1.flavor(), leg2.flavor()) != channel {
            return;
        }
        flow.fill(
            match charge {
                ChargeRelation::SameSign => steps::SAME_SIGN,
                ChargeRelation::OppositeSign => steps::OPPOSITE_SIGN,
            },
            w,
        );
        let (hard, soft) = if leg1.pt() >= leg2.pt() {
            (leg1, leg2)
        } else {
            (leg2, leg1)
        };
        if hard.pt() < cuts.leading(hard.flavor()) || soft.pt() < cuts.trailing(soft.flavor()) {
            return;
        }
        flow.fill(steps::PT_CUTS, w);

        let numbers = &mut yields.numbers;
        let hists = &mut yields.histograms;
        let (pt1, pt2) = (leg1.pt(), leg2.pt());
        match (leg1.tight, leg2.tight) {
            (true, true) => {
                numbers.nt2 += w;
                hists.nt2.fill(pt1, pt2, w);
                flow.fill(steps::TIGHT_TIGHT, w);
                let region_of =
                    |c: &Candidate| DetectorRegion::from_eta(c.lepton.eta, sel.barrel_eta);
                match channel {
                    Channel::ElEl => yields.split.fill(region_of(&leg1), region_of(&leg2), w),
                    Channel::ElMu => {
                        // only the electron can flip its charge; leg 2 is always the electron
                        let electron = region_of(&leg2);
                        yields.split.fill(electron, electron, w)
                    }
                    Channel::MuMu => {}
                }
            }
            (true, false) => {
                numbers.nt10 += w;
                hists.nt10.fill(pt1, pt2, w);
            }
            (false, true) if channel.is_same_flavor() => {
                numbers.nt10 += w;
                hists.nt10.fill(pt2, pt1, w);
            }
            (false, true) => {
                numbers.nt01 += w;
                hists.nt01.fill(pt1, pt2, w);
            }
            (false, false) => {
                numbers.nt0 += w;
                hists.nt0.fill(pt1, pt2, w);
            }
        }
    }

    fn fill_fake_control(
        &self,
        view: &EventView,
        sample: &Sample,
        flavor: Flavor,
        yields: &mut ChannelYields,
    ) {
        let sel = &self.config.selection;
        let (stream, prescale) = match flavor {
            Flavor::Muon => (Stream::SingleMu, view.event.triggers.single_mu_prescale),
            Flavor::Electron => (Stream::SingleEle, view.event.triggers.single_el_prescale),
        };
        if !self.fires(view.event, sample, stream) {
            return;
        }
        let mut of_flavor = view.loose.iter().filter(|c| c.flavor() == flavor);
        let (Some(lepton), None) = (of_flavor.next(), of_flavor.next()) else {
            return;
        };
        if !view.has_hard_jet
            || lepton.lepton.mt >= sel.control_max_mt
            || view.event.met >= sel.control_max_met
        {
            return;
        }
        let w = view.weight * prescale;
        let (pt, eta) = (lepton.pt(), lepton.lepton.eta);
        yields.numbers.nssl += w;
        yields.histograms.fake_loose.fill(pt, eta, w);
        if lepton.tight {
            yields.numbers.nsst += w;
            yields.histograms.fake_tight.fill(pt, eta, w);
        }
    }

    fn fill_prompt_control(
        &self,
        view: &EventView,
        sample: &Sample,
        flavor: Flavor,
        yields: &mut ChannelYields,
    ) {
        let sel = &self.config.selection;
        let stream = flavor.control_channel().stream();
        if !self.fires(view.event, sample, stream) {
            return;
        }
        if view.n_jets_loose_clean < sel.prompt_min_jets {
            return;
        }
        let mut of_flavor = view.loose.iter().filter(|c| c.flavor() == flavor);
        let (Some(first), Some(second), None) =
            (of_flavor.next(), of_flavor.next(), of_flavor.next())
        else {
            return;
        };
        if !(first.tight || second.tight) || first.lepton.charge == second.lepton.charge {
            return;
        }
        let mass = (first.lepton.p4() + second.lepton.p4()).m();
        if (mass - sel.z_mass).abs() > sel.z_window || view.event.met >= sel.control_max_met {
            return;
        }
        // the softer leg is measured unless only it is tight
        let measured = if second.tight && !first.tight {
            first
        } else {
            second
        };
        let w = view.weight;
        let (pt, eta) = (measured.pt(), measured.lepton.eta);
        yields.numbers.nzl += w;
        yields.histograms.prompt_loose.fill(pt, eta, w);
        if measured.tight {
            yields.numbers.nzt += w;
            yields.histograms.prompt_tight.fill(pt, eta, w);
        }
    }

    /// Run every event of one sample through the classifier.
    ///
    /// Returns the number of events read. A read error aborts the sample; the caller decides
    /// whether to exclude it.
    pub fn accumulate(&self, sample: &Sample, store: &mut YieldStore) -> SsdlResult<usize> {
        let mut n_events = 0;
        for event in sample.open()? {
            self.classify(&event?, sample, store);
            n_events += 1;
        }
        debug!("Read {} events from {}", n_events, sample.sname);
        Ok(n_events)
    }

    fn accumulate_one(&self, sample: &Sample, charge: ChargeRelation) -> SsdlResult<YieldStore> {
        let mut store = self.empty_store(charge)?;
        self.accumulate(sample, &mut store)?;
        Ok(store)
    }

    pub fn empty_store(&self, charge: ChargeRelation) -> SsdlResult<YieldStore> {
        Ok(YieldStore::new(
            charge,
            self.config.binning.pt_axis()?,
            self.config.binning.eta_axis()?,
        ))
    }

    /// Accumulate several samples into one store.
    ///
    /// Samples are processed independently (in parallel with the `rayon` feature) and merged in
    /// the given order. A sample whose events cannot be read is left out of the store and
    /// returned as excluded.
    pub fn accumulate_all(
        &self,
        samples: &[&Sample],
        charge: ChargeRelation,
    ) -> SsdlResult<(YieldStore, Vec<ExcludedSample>)> {
        info!(
            "Accumulating {} samples ({} pass)",
            samples.len(),
            charge
        );
        #[cfg(feature = "rayon")]
        let results: Vec<SsdlResult<YieldStore>> = samples
            .par_iter()
            .map(|sample| self.accumulate_one(sample, charge))
            .collect();
        #[cfg(not(feature = "rayon"))]
        let results: Vec<SsdlResult<YieldStore>> = samples
            .iter()
            .map(|sample| self.accumulate_one(sample, charge))
            .collect();
        let mut store = self.empty_store(charge)?;
        let mut excluded = Vec::new();
        for (sample, result) in samples.iter().zip(results) {
            match result {
                Ok(part) => store = &store + &part,
                Err(err) => {
                    warn!("Excluding sample {}: {}", sample.sname, err);
                    excluded.push(ExcludedSample {
                        name: sample.name.clone(),
                        reason: err,
                    });
                }
            }
        }
        Ok((store, excluded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{test_event, test_lepton, Jet, Triggers},
        samples::SourceLocator,
        utils::enums::SampleKind,
    };
    use approx::assert_relative_eq;

    fn mc(events: Vec<EventRecord>) -> Sample {
        Sample::in_memory("MC", SampleKind::Background, 1000.0, None, events, 1000.0).unwrap()
    }

    fn classifier() -> EventClassifier {
        EventClassifier::with_default_selector(AnalysisConfig::default())
    }

    fn run(events: Vec<EventRecord>, charge: ChargeRelation) -> YieldStore {
        let sample = mc(events);
        let c = classifier();
        let mut store = c.empty_store(charge).unwrap();
        c.accumulate(&sample, &mut store).unwrap();
        store
    }

    fn loose(mut lepton: Lepton) -> Lepton {
        lepton.iso = 0.5;
        lepton
    }

    fn jets(pts: &[f64]) -> Vec<Jet> {
        pts.iter()
            .enumerate()
            .map(|(i, &pt)| Jet {
                pt,
                eta: 0.0,
                phi: -1.5 + 0.7 * i as f64,
            })
            .collect()
    }

    #[test]
    fn test_tight_tight_dimuon() {
        let store = run(vec![test_event()], ChargeRelation::SameSign);
        let numbers = store.numbers("MC", "Baseline", Channel::MuMu);
        assert_relative_eq!(numbers.nt2, 1.0);
        assert_relative_eq!(numbers.n_pairs(), 1.0);
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::ElEl).n_pairs(), 0.0);
        // HT = 230 fails the 400 GeV regions
        assert_relative_eq!(store.numbers("MC", "HT400MET50", Channel::MuMu).n_pairs(), 0.0);
        let flow = &store.get("MC", "Baseline", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::ALL), 1.0);
        assert_relative_eq!(flow.get(steps::TIGHT_TIGHT), 1.0);
        let flow = &store.get("MC", "HT400MET50", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::NJETS), 1.0);
        assert_relative_eq!(flow.get(steps::HT), 0.0);
    }

    #[test]
    fn test_loose_tight_goes_to_nt10_with_tight_leg_first() {
        let mut event = test_event();
        event.leptons[0] = loose(event.leptons[0].clone());
        event.weight = 0.5;
        let store = run(vec![event], ChargeRelation::SameSign);
        let yields = store.get("MC", "Baseline", Channel::MuMu).unwrap();
        assert_relative_eq!(yields.numbers.nt10, 0.5);
        assert_relative_eq!(yields.numbers.nt01, 0.0);
        // tight leg is the 22 GeV muon: x bin [20, 30), y bin [30, 40)
        assert_relative_eq!(yields.histograms.nt10.get(1, 2), 0.5);
    }

    #[test]
    fn test_emu_categories_put_muon_first() {
        let mut event = test_event();
        event.triggers = Triggers {
            mu_el: true,
            ..Triggers::default()
        };
        event.leptons = vec![
            loose(test_lepton(Flavor::Electron, 40.0, 0.3, 0.2, -1)),
            test_lepton(Flavor::Muon, 25.0, 1.0, 2.0, -1),
        ];
        let store = run(vec![event.clone()], ChargeRelation::SameSign);
        let numbers = store.numbers("MC", "Baseline", Channel::ElMu);
        assert_relative_eq!(numbers.nt10, 1.0);
        event.leptons[0].iso = 0.05;
        event.leptons[1].iso = 0.5;
        let store = run(vec![event], ChargeRelation::SameSign);
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::ElMu).nt01, 1.0);
    }

    #[test]
    fn test_emu_leading_threshold_follows_harder_lepton() {
        let mut event = test_event();
        event.triggers.mu_el = true;
        // electron is harder but below the 20 GeV leading cut; muon at 15 passes trailing only
        event.leptons = vec![
            test_lepton(Flavor::Electron, 18.0, 0.3, 0.2, 1),
            test_lepton(Flavor::Muon, 15.0, 1.0, 2.0, 1),
        ];
        let store = run(vec![event], ChargeRelation::SameSign);
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::ElMu).n_pairs(), 0.0);
    }

    #[test]
    fn test_z_veto_and_low_mass_veto() {
        let mut event = test_event();
        // add an opposite-sign tight muon making a Z with the leading one
        event.leptons.push(test_lepton(Flavor::Muon, 45.6, 0.0, 0.3 + std::f64::consts::PI, -1));
        let lead = test_lepton(Flavor::Muon, 45.6, 0.0, 0.3, 1);
        event.leptons[0] = lead;
        let store = run(vec![event], ChargeRelation::SameSign);
        let flow = &store.get("MC", "Baseline", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::LOOSE), 1.0);
        assert_relative_eq!(flow.get(steps::Z_VETO), 0.0);

        let mut event = test_event();
        // nearly collinear pair with m < 5 GeV
        event.leptons[1] = test_lepton(Flavor::Muon, 12.0, 0.42, 0.32, 1);
        let store = run(vec![event], ChargeRelation::SameSign);
        let flow = &store.get("MC", "Baseline", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::Z_VETO), 1.0);
        assert_relative_eq!(flow.get(steps::MINV_VETO), 0.0);
    }

    #[test]
    fn test_hardest_same_sign_pair_decides_channel() {
        let mut event = test_event();
        event.triggers.double_el = true;
        event.leptons.push(test_lepton(Flavor::Electron, 60.0, 0.1, -1.0, -1));
        event.leptons.push(test_lepton(Flavor::Electron, 50.0, -0.5, 1.6, -1));
        let store = run(vec![event], ChargeRelation::SameSign);
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::ElEl).nt2, 1.0);
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::MuMu).nt2, 0.0);
    }

    #[test]
    fn test_opposite_sign_pass() {
        let mut event = test_event();
        event.leptons[1].charge = -1;
        let ss = run(vec![event.clone()], ChargeRelation::SameSign);
        assert_relative_eq!(ss.numbers("MC", "Baseline", Channel::MuMu).n_pairs(), 0.0);
        let os = run(vec![event], ChargeRelation::OppositeSign);
        assert_relative_eq!(os.numbers("MC", "Baseline", Channel::MuMu).nt2, 1.0);
        let flow = &os.get("MC", "Baseline", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::OPPOSITE_SIGN), 1.0);
    }

    #[test]
    fn test_detector_split_for_electrons() {
        let mut event = test_event();
        event.triggers = Triggers {
            double_el: true,
            ..Triggers::default()
        };
        event.leptons = vec![
            test_lepton(Flavor::Electron, 40.0, 0.3, 0.2, 1),
            test_lepton(Flavor::Electron, 30.0, 2.0, 2.0, 1),
        ];
        let store = run(vec![event], ChargeRelation::SameSign);
        let split = store.get("MC", "Baseline", Channel::ElEl).unwrap().split;
        assert_relative_eq!(split.eb, 1.0);
        assert_relative_eq!(split.bb + split.ee, 0.0);
    }

    #[test]
    fn test_fake_ratio_control_region() {
        let mut tight = EventRecord {
            triggers: Triggers {
                single_mu: true,
                single_mu_prescale: 4.0,
                ..Triggers::default()
            },
            leptons: vec![test_lepton(Flavor::Muon, 15.0, 0.5, 0.0, 1)],
            jets: jets(&[70.0]),
            met: 5.0,
            ..EventRecord::default()
        };
        tight.leptons[0].mt = 8.0;
        let mut loose_event = tight.clone();
        loose_event.leptons[0].iso = 0.6;
        let mut high_met = tight.clone();
        high_met.met = 25.0;
        let mut two = tight.clone();
        two.leptons.push(test_lepton(Flavor::Muon, 12.0, -1.0, 1.5, -1));
        let store = run(vec![tight, loose_event, high_met, two], ChargeRelation::SameSign);
        let numbers = store.numbers("MC", "Baseline", Channel::MuMu);
        assert_relative_eq!(numbers.nsst, 4.0);
        assert_relative_eq!(numbers.nssl, 8.0);
        let hists = &store.get("MC", "Baseline", Channel::MuMu).unwrap().histograms;
        assert_relative_eq!(hists.fake_loose.get(0, 0), 8.0);
    }

    #[test]
    fn test_prompt_ratio_measured_leg() {
        let z_event = |tight1: bool, tight2: bool| {
            let mut e1 = test_lepton(Flavor::Electron, 45.6, 0.0, 0.0, 1);
            let mut e2 = test_lepton(Flavor::Electron, 40.0, 0.1, std::f64::consts::PI, -1);
            if !tight1 {
                e1.iso = 0.5;
            }
            if !tight2 {
                e2.iso = 0.5;
            }
            EventRecord {
                triggers: Triggers {
                    double_el: true,
                    ..Triggers::default()
                },
                leptons: vec![e1, e2],
                jets: jets(&[40.0, 35.0]),
                met: 10.0,
                ..EventRecord::default()
            }
        };
        // both tight: the softer (tight) leg is measured; harder tight only: the softer loose
        // leg; softer tight only: the harder loose leg
        let store = run(
            vec![z_event(true, true), z_event(true, false), z_event(false, true)],
            ChargeRelation::SameSign,
        );
        let numbers = store.numbers("MC", "Control", Channel::ElEl);
        assert_relative_eq!(numbers.nzl, 3.0);
        assert_relative_eq!(numbers.nzt, 1.0);
    }

    #[test]
    fn test_prompt_ratio_needs_exactly_two_leptons() {
        let z_event = EventRecord {
            triggers: Triggers {
                double_mu: true,
                ..Triggers::default()
            },
            leptons: vec![
                test_lepton(Flavor::Muon, 45.6, 0.0, 0.0, 1),
                test_lepton(Flavor::Muon, 40.0, 0.1, std::f64::consts::PI, -1),
            ],
            jets: jets(&[40.0, 35.0]),
            met: 10.0,
            ..EventRecord::default()
        };
        let mut three = z_event.clone();
        three
            .leptons
            .push(loose(test_lepton(Flavor::Muon, 15.0, -1.2, 1.6, 1)));
        let store = run(vec![z_event, three], ChargeRelation::SameSign);
        let numbers = store.numbers("MC", "Control", Channel::MuMu);
        assert_relative_eq!(numbers.nzl, 1.0);
        assert_relative_eq!(numbers.nzt, 1.0);
    }

    #[test]
    fn test_emu_detector_split_follows_electron() {
        let mut event = test_event();
        event.triggers.mu_el = true;
        event.leptons = vec![
            test_lepton(Flavor::Muon, 40.0, 0.3, 0.2, 1),
            test_lepton(Flavor::Electron, 30.0, 2.0, 2.0, 1),
        ];
        let store = run(vec![event], ChargeRelation::SameSign);
        let split = store.get("MC", "Baseline", Channel::ElMu).unwrap().split;
        assert_relative_eq!(split.ee, 1.0);
        assert_relative_eq!(split.bb + split.eb, 0.0);
    }

    #[test]
    fn test_soft_muons_reach_pair_histograms() {
        let mut config = AnalysisConfig::default();
        config.selection.pt_selection = crate::config::PtSelection::LowPt;
        let c = EventClassifier::with_default_selector(config);
        let mut tight = test_event();
        tight.leptons[1].pt = 7.0;
        let mut tight_loose = tight.clone();
        tight_loose.leptons[1].iso = 0.5;
        let sample = mc(vec![tight, tight_loose]);
        let mut store = c.empty_store(ChargeRelation::SameSign).unwrap();
        c.accumulate(&sample, &mut store).unwrap();
        let yields = store.get("MC", "Baseline", Channel::MuMu).unwrap();
        assert_relative_eq!(yields.numbers.nt2, 1.0);
        assert_relative_eq!(yields.numbers.nt10, 1.0);
        // the 7 GeV leg sits below the first pt edge and is kept in the first bin
        assert_relative_eq!(yields.histograms.nt2.get(2, 0), 1.0);
        assert_relative_eq!(yields.histograms.nt10.get(2, 0), 1.0);
        let hists = &yields.histograms;
        let binned = hists.nt2.integral()
            + hists.nt10.integral()
            + hists.nt01.integral()
            + hists.nt0.integral();
        assert_relative_eq!(binned, yields.numbers.n_pairs());
    }

    #[test]
    fn test_data_stream_blocks_foreign_triggers() {
        let mut event = test_event();
        event.triggers.mu_el = true;
        let data = Sample::in_memory(
            "MuEG",
            SampleKind::Data,
            0.0,
            Some(Stream::MuEG),
            vec![event],
            1000.0,
        )
        .unwrap();
        let c = classifier();
        let mut store = c.empty_store(ChargeRelation::SameSign).unwrap();
        c.accumulate(&data, &mut store).unwrap();
        let flow = &store.get("MuEG", "Baseline", Channel::MuMu).unwrap().cutflow;
        assert_relative_eq!(flow.get(steps::ALL), 1.0);
        assert_relative_eq!(flow.get(steps::TRIGGER), 0.0);
    }

    #[test]
    fn test_tighter_region_never_gains_events() {
        let mut rng = fastrand::Rng::with_seed(7);
        let events: Vec<EventRecord> = (0..400)
            .map(|i| {
                let flavor = |rng: &mut fastrand::Rng| {
                    if rng.bool() {
                        Flavor::Muon
                    } else {
                        Flavor::Electron
                    }
                };
                let leptons = (0..2 + rng.usize(0..2))
                    .map(|_| {
                        let mut l = test_lepton(
                            flavor(&mut rng),
                            10.0 + 60.0 * rng.f64(),
                            -2.4 + 4.8 * rng.f64(),
                            -3.1 + 6.2 * rng.f64(),
                            if rng.bool() { 1 } else { -1 },
                        );
                        l.iso = 0.3 * rng.f64();
                        l
                    })
                    .collect();
                EventRecord {
                    event: i,
                    triggers: Triggers {
                        double_mu: true,
                        double_el: true,
                        mu_el: true,
                        ..Triggers::default()
                    },
                    leptons,
                    jets: (0..rng.usize(1..6))
                        .map(|_| Jet {
                            pt: 30.0 + 200.0 * rng.f64(),
                            eta: -2.5 + 5.0 * rng.f64(),
                            phi: -3.1 + 6.2 * rng.f64(),
                        })
                        .collect(),
                    met: 200.0 * rng.f64(),
                    ..EventRecord::default()
                }
            })
            .collect();
        let store = run(events, ChargeRelation::SameSign);
        let mut any = false;
        for channel in Channel::ALL {
            let base = store.numbers("MC", "Baseline", channel);
            let tight = store.numbers("MC", "HT400MET120", channel);
            let total = |n: &crate::NumberSet| n.nt2 + n.nt10 + n.nt01 + n.nt0;
            assert!(total(&tight) <= total(&base));
            any |= total(&base) > 0.0;
        }
        assert!(any);
    }

    #[test]
    fn test_accumulate_all_excludes_unreadable_samples() {
        let good = mc(vec![test_event()]);
        let broken = Sample::new(
            "Broken",
            "Broken",
            SourceLocator::File("/no/such/events.jsonl".to_string()),
            100.0,
            SampleKind::Background,
            None,
            1000.0,
        )
        .unwrap();
        let (store, excluded) = classifier()
            .accumulate_all(&[&good, &broken], ChargeRelation::SameSign)
            .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].name, "Broken");
        assert!(!store.contains_sample("Broken"));
        assert_relative_eq!(store.numbers("MC", "Baseline", Channel::MuMu).nt2, 1.0);
    }
}
