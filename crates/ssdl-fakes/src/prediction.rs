use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use ssdl_core::{
    config::{AnalysisConfig, ChargeMisIdConfig, PredictionMode, RatioSystematics},
    samples::ExcludedSample,
    yields::DetectorSplit,
    Channel, ControlRegion, Flavor, Sample, SsdlError, SsdlResult, YieldStore,
};

use crate::{
    matrix::{
        Estimate, ExcludedBin, FakeRateMatrixSolver, FakeRateSolution, LegMaps, LegRatios,
        ObservedCounts, Topology,
    },
    ratio::{Ratio, RatioEstimator, RatioMap},
};

/// Prompt and fake ratio of one flavor.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlavorRatios {
    pub prompt: Ratio,
    pub fake: Ratio,
}

fn extra_systematic(extra: &RatioSystematics, flavor: Flavor, kind: ControlRegion) -> f64 {
    match (flavor, kind) {
        (Flavor::Muon, ControlRegion::PromptRate) => extra.mu_p,
        (Flavor::Muon, ControlRegion::FakeRate) => extra.mu_f,
        (Flavor::Electron, ControlRegion::PromptRate) => extra.el_p,
        (Flavor::Electron, ControlRegion::FakeRate) => extra.el_f,
    }
}

/// Integrated ratios of both flavors. A flavor whose control regions are empty keeps the
/// error, and only channels which need that flavor fail.
#[derive(Clone, Debug)]
pub struct FakeRateSet {
    pub muon: SsdlResult<FlavorRatios>,
    pub electron: SsdlResult<FlavorRatios>,
}

impl FakeRateSet {
    pub fn new(muon: FlavorRatios, electron: FlavorRatios) -> Self {
        Self {
            muon: Ok(muon),
            electron: Ok(electron),
        }
    }

    /// Pool the control regions of `samples` in `region`.
    pub fn measure(
        estimator: &RatioEstimator,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
        extra: &RatioSystematics,
    ) -> Self {
        let measure_flavor = |flavor: Flavor| -> SsdlResult<FlavorRatios> {
            let ratio = |kind: ControlRegion| -> SsdlResult<Ratio> {
                Ok(estimator
                    .compute(samples, store, region, flavor, kind)?
                    .with_systematic(extra_systematic(extra, flavor, kind)))
            };
            Ok(FlavorRatios {
                prompt: ratio(ControlRegion::PromptRate)?,
                fake: ratio(ControlRegion::FakeRate)?,
            })
        };
        let set = Self {
            muon: measure_flavor(Flavor::Muon),
            electron: measure_flavor(Flavor::Electron),
        };
        for (flavor, result) in [(Flavor::Muon, &set.muon), (Flavor::Electron, &set.electron)] {
            match result {
                Ok(r) => info!(
                    "{} ratios in {}: p = {}, f = {}",
                    flavor, region, r.prompt, r.fake
                ),
                Err(err) => warn!("No {} ratios in {}: {}", flavor, region, err),
            }
        }
        set
    }

    pub fn flavor(&self, flavor: Flavor) -> SsdlResult<FlavorRatios> {
        match flavor {
            Flavor::Muon => self.muon.clone(),
            Flavor::Electron => self.electron.clone(),
        }
    }

    pub fn legs(&self, topology: Topology) -> SsdlResult<[LegRatios; 2]> {
        let [a, b] = topology.flavors();
        let (a, b) = (self.flavor(a)?, self.flavor(b)?);
        Ok([
            LegRatios::from_ratios(&a.prompt, &a.fake),
            LegRatios::from_ratios(&b.prompt, &b.fake),
        ])
    }
}

/// Prompt and fake ratio maps of one flavor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlavorMaps {
    pub prompt: RatioMap,
    pub fake: RatioMap,
}

impl FlavorMaps {
    fn leg(&self) -> LegMaps {
        LegMaps {
            prompt: &self.prompt,
            fake: &self.fake,
        }
    }
}

/// Binned ratios of both flavors.
#[derive(Clone, Debug)]
pub struct RatioMapSet {
    pub muon: SsdlResult<FlavorMaps>,
    pub electron: SsdlResult<FlavorMaps>,
}

impl RatioMapSet {
    /// Pool the control-region maps of `samples` in `region`. Empty prompt bins take
    /// `prompt_default`; empty fake bins stay undefined.
    pub fn measure(
        estimator: &RatioEstimator,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
        extra: &RatioSystematics,
        prompt_default: Ratio,
    ) -> Self {
        let measure_flavor = |flavor: Flavor| -> SsdlResult<FlavorMaps> {
            let map = |kind: ControlRegion, default: Option<Ratio>| -> SsdlResult<RatioMap> {
                Ok(estimator
                    .compute_map(samples, store, region, flavor, kind, default)?
                    .with_systematic(extra_systematic(extra, flavor, kind)))
            };
            Ok(FlavorMaps {
                prompt: map(ControlRegion::PromptRate, Some(prompt_default))?,
                fake: map(ControlRegion::FakeRate, None)?,
            })
        };
        Self {
            muon: measure_flavor(Flavor::Muon),
            electron: measure_flavor(Flavor::Electron),
        }
    }

    fn flavor(&self, flavor: Flavor) -> SsdlResult<&FlavorMaps> {
        let maps = match flavor {
            Flavor::Muon => &self.muon,
            Flavor::Electron => &self.electron,
        };
        maps.as_ref().map_err(|err| err.clone())
    }

    pub fn legs(&self, topology: Topology) -> SsdlResult<[LegMaps; 2]> {
        let [a, b] = topology.flavors();
        Ok([self.flavor(a)?.leg(), self.flavor(b)?.leg()])
    }
}

/// Expected same-sign pairs from opposite-sign pairs where an electron charge was mismeasured.
///
/// Each electron flips with probability `pB` in the barrel and `pE` in the endcap; an
/// electron pair flips if either leg does.
pub fn charge_misid_estimate(
    config: &ChargeMisIdConfig,
    channel: Channel,
    split: &DetectorSplit,
) -> Estimate {
    let (pb, pe) = (config.barrel, config.endcap);
    let (bb, eb, ee) = (split.bb.max(0.0), split.eb.max(0.0), split.ee.max(0.0));
    match channel {
        Channel::MuMu => Estimate::default(),
        Channel::ElEl => Estimate::new(
            2.0 * pb * split.bb + 2.0 * pe * split.ee + (pb + pe) * split.eb,
            ((2.0 * pb).powi(2) * bb + (2.0 * pe).powi(2) * ee + (pb + pe).powi(2) * eb).sqrt(),
            ((2.0 * split.bb + split.eb) * config.barrel_error)
                .hypot((2.0 * split.ee + split.eb) * config.endcap_error),
        ),
        Channel::ElMu => Estimate::new(
            pb * split.bb + pe * split.ee,
            (pb * pb * bb + pe * pe * ee).sqrt(),
            (split.bb * config.barrel_error).hypot(split.ee * config.endcap_error),
        ),
    }
}

/// The background prediction of one channel.
#[derive(Clone, Debug)]
pub struct ChannelPrediction {
    pub channel: Channel,
    /// Sum of the scaled per-sample solutions.
    pub fake: FakeRateSolution,
    pub per_sample: IndexMap<String, FakeRateSolution>,
    pub charge_misid: Estimate,
    /// Normalized tight-tight count of the observed samples.
    pub observed: f64,
    /// Bins left out in binned mode, with the sample they belong to.
    pub excluded_bins: Vec<(String, ExcludedBin)>,
}

impl ChannelPrediction {
    pub fn fake(&self) -> Estimate {
        self.fake.predicted_fake()
    }

    pub fn total_background(&self) -> Estimate {
        self.fake() + self.charge_misid
    }
}

/// Predictions of every channel of one region.
#[derive(Clone, Debug)]
pub struct CombinedPrediction {
    pub region: String,
    pub mode: PredictionMode,
    pub ratios: FakeRateSet,
    pub channels: Vec<ChannelPrediction>,
    pub failed_channels: Vec<(Channel, SsdlError)>,
    pub excluded_samples: Vec<ExcludedSample>,
}

impl CombinedPrediction {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelPrediction> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    pub fn fake(&self) -> Estimate {
        self.channels
            .iter()
            .fold(Estimate::default(), |acc, c| acc + c.fake())
    }

    pub fn charge_misid(&self) -> Estimate {
        self.channels
            .iter()
            .fold(Estimate::default(), |acc, c| acc + c.charge_misid)
    }

    pub fn total_background(&self) -> Estimate {
        self.fake() + self.charge_misid()
    }

    pub fn observed(&self) -> f64 {
        self.channels.iter().map(|c| c.observed).sum()
    }

    pub fn excluded_bins(&self) -> impl Iterator<Item = (Channel, &str, &ExcludedBin)> {
        self.channels.iter().flat_map(|c| {
            c.excluded_bins
                .iter()
                .map(move |(sample, bin)| (c.channel, sample.as_str(), bin))
        })
    }
}

/// The samples and stores a prediction draws on.
#[derive(Clone, Copy, Debug)]
pub struct PredictionInputs<'a> {
    /// Samples whose control regions give the ratios.
    pub ratio_samples: &'a [&'a Sample],
    /// Samples whose pair counts are decomposed.
    pub fake_samples: &'a [&'a Sample],
    /// Samples whose tight-tight counts are compared to the prediction and whose
    /// opposite-sign electron pairs give the charge-misidentification estimate.
    pub observed_samples: &'a [&'a Sample],
    /// Same-sign yields.
    pub store: &'a YieldStore,
    /// Opposite-sign yields, if accumulated.
    pub os_store: Option<&'a YieldStore>,
}

/// Turns yields into per-channel background predictions.
#[derive(Clone, Debug)]
pub struct PredictionAggregator {
    solver: FakeRateMatrixSolver,
    estimator: RatioEstimator,
    mode: PredictionMode,
    config: AnalysisConfig,
}

impl PredictionAggregator {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            solver: FakeRateMatrixSolver::from_config(&config.ratios),
            estimator: RatioEstimator::new(config.ratios.model),
            mode: config.prediction,
            config: config.clone(),
        }
    }

    pub fn with_mode(mut self, mode: PredictionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PredictionMode {
        self.mode
    }

    pub fn solver(&self) -> &FakeRateMatrixSolver {
        &self.solver
    }

    pub fn measure_ratios(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
    ) -> FakeRateSet {
        FakeRateSet::measure(
            &self.estimator,
            samples,
            store,
            region,
            &self.config.ratios.extra_systematics,
        )
    }

    pub fn measure_maps(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
    ) -> RatioMapSet {
        let ratios = &self.config.ratios;
        RatioMapSet::measure(
            &self.estimator,
            samples,
            store,
            region,
            &ratios.extra_systematics,
            Ratio::symmetric(ratios.prompt_default, ratios.prompt_default_error),
        )
    }

    /// Predict every channel of `region`.
    ///
    /// A channel which cannot be solved (missing ratios, degenerate system) is logged and
    /// listed in [`CombinedPrediction::failed_channels`]; the other channels are unaffected.
    pub fn predict(
        &self,
        inputs: &PredictionInputs,
        region: &str,
    ) -> SsdlResult<CombinedPrediction> {
        self.config.region(region)?;
        let ratios = self.measure_ratios(inputs.ratio_samples, inputs.store, region);
        let maps = match self.mode {
            PredictionMode::Binned => {
                Some(self.measure_maps(inputs.ratio_samples, inputs.store, region))
            }
            PredictionMode::Integrated => None,
        };
        let mut channels = Vec::new();
        let mut failed_channels = Vec::new();
        for channel in Channel::ALL {
            match self.predict_channel(inputs, region, channel, &ratios, maps.as_ref()) {
                Ok(prediction) => channels.push(prediction),
                Err(err) => {
                    warn!("No {} prediction in {}: {}", channel.label(), region, err);
                    failed_channels.push((channel, err));
                }
            }
        }
        Ok(CombinedPrediction {
            region: region.to_string(),
            mode: self.mode,
            ratios,
            channels,
            failed_channels,
            excluded_samples: Vec::new(),
        })
    }

    /// Predict one channel. Each sample is solved on its own counts and the solution is
    /// scaled by the sample normalization before summing.
    pub fn predict_channel(
        &self,
        inputs: &PredictionInputs,
        region: &str,
        channel: Channel,
        ratios: &FakeRateSet,
        maps: Option<&RatioMapSet>,
    ) -> SsdlResult<ChannelPrediction> {
        let topology = Topology::of_channel(channel);
        let mut fake = FakeRateSolution::zero(topology);
        let mut per_sample = IndexMap::new();
        let mut excluded_bins = Vec::new();
        for sample in inputs.fake_samples {
            let Some(yields) = inputs.store.get(&sample.sname, region, channel) else {
                continue;
            };
            if ObservedCounts::from_numbers(&yields.numbers).is_empty() {
                continue;
            }
            let solution = match maps {
                Some(maps) => {
                    let binned = self.solver.solve_binned(
                        topology,
                        maps.legs(topology)?,
                        &yields.histograms,
                        self.config.binning.reference_eta,
                    )?;
                    excluded_bins.extend(
                        binned
                            .excluded
                            .into_iter()
                            .map(|bin| (sample.sname.clone(), bin)),
                    );
                    binned.total
                }
                None => self.solver.solve(
                    topology,
                    &ratios.legs(topology)?,
                    &ObservedCounts::from_numbers(&yields.numbers),
                )?,
            }
            .scaled(sample.scale());
            fake = &fake + &solution;
            per_sample.insert(sample.sname.clone(), solution);
        }
        let mut charge_misid = Estimate::default();
        if let Some(os_store) = inputs.os_store {
            for sample in inputs.observed_samples {
                if let Some(yields) = os_store.get(&sample.sname, region, channel) {
                    charge_misid = charge_misid
                        + charge_misid_estimate(&self.config.charge_misid, channel, &yields.split)
                            .scaled(sample.scale());
                }
            }
        }
        let observed = inputs
            .observed_samples
            .iter()
            .map(|s| inputs.store.numbers(&s.sname, region, channel).nt2 * s.scale())
            .sum();
        Ok(ChannelPrediction {
            channel,
            fake,
            per_sample,
            charge_misid,
            observed,
            excluded_bins,
        })
    }

    /// Predict the background of simulated samples from their own control regions and compare
    /// it to their own tight-tight counts.
    pub fn closure(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        os_store: Option<&YieldStore>,
        region: &str,
    ) -> SsdlResult<CombinedPrediction> {
        let inputs = PredictionInputs {
            ratio_samples: samples,
            fake_samples: samples,
            observed_samples: samples,
            store,
            os_store,
        };
        self.predict(&inputs, region)
    }
}
