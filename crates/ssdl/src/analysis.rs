use std::{fs::File, io::BufReader};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use ssdl_core::{
    config::{load_sample_list, PredictionMode},
    data::expand_path,
    samples::ExcludedSample,
    AnalysisConfig, ChargeRelation, EventClassifier, Sample, SampleKind, SampleRegistry,
    SsdlResult, YieldStore,
};
use ssdl_fakes::{CombinedPrediction, PredictionAggregator, PredictionInputs, Report};

/// The same-sign and opposite-sign yields of every sample, as written between the
/// accumulation and prediction phases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisYields {
    pub same_sign: YieldStore,
    pub opposite_sign: YieldStore,
}

impl AnalysisYields {
    pub fn save(&self, file_path: &str) -> SsdlResult<()> {
        let file = File::create(expand_path(file_path)?)?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load(file_path: &str) -> SsdlResult<Self> {
        let file = File::open(expand_path(file_path)?)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// The store filled under `charge`.
    pub fn store(&self, charge: ChargeRelation) -> &YieldStore {
        match charge {
            ChargeRelation::SameSign => &self.same_sign,
            ChargeRelation::OppositeSign => &self.opposite_sign,
        }
    }

    /// The opposite-sign store feeding the charge misidentification estimate. Only a same-sign
    /// selection has such a background.
    fn charge_flip_source(&self, charge: ChargeRelation) -> Option<&YieldStore> {
        match charge {
            ChargeRelation::SameSign => Some(&self.opposite_sign),
            ChargeRelation::OppositeSign => None,
        }
    }
}

/// Ties the configuration, the registered samples and both analysis phases together.
///
/// Phase one reads every sample once per charge relation and fills the yield stores. Phase two
/// only works on the stores, so it can be rerun with other regions or prediction modes without
/// touching the events again.
pub struct Analysis {
    config: AnalysisConfig,
    registry: SampleRegistry,
    classifier: EventClassifier,
}

impl Analysis {
    pub fn new(config: AnalysisConfig, registry: SampleRegistry) -> SsdlResult<Self> {
        config.validate()?;
        Ok(Self {
            classifier: EventClassifier::with_default_selector(config.clone()),
            config,
            registry,
        })
    }

    /// Read the configuration (or use the defaults) and register every sample of the list.
    pub fn from_files(config_path: Option<&str>, samples_path: &str) -> SsdlResult<Self> {
        let config = match config_path {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        let records = load_sample_list(samples_path)?;
        let mut registry = SampleRegistry::new(config.target_lumi);
        let n = registry.register_all(&records);
        info!("Registered {} of {} samples", n, records.len());
        Self::new(config, registry)
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn registry(&self) -> &SampleRegistry {
        &self.registry
    }

    pub fn set_prediction_mode(&mut self, mode: PredictionMode) {
        self.config.prediction = mode;
    }

    /// Charge relation of the pairs being predicted (`selection.charge`).
    pub fn charge(&self) -> ChargeRelation {
        self.config.selection.charge
    }

    fn samples(&self) -> Vec<&Sample> {
        self.registry.iter().collect()
    }

    fn drop_failed(&mut self, failed: Vec<ExcludedSample>) {
        for excluded in failed {
            let sname = self
                .registry
                .iter()
                .find(|s| s.name == excluded.name)
                .map(|s| s.sname.clone());
            if let Some(sname) = sname {
                self.registry.exclude(&sname, excluded.reason);
            }
        }
    }

    /// Phase one: fill the same-sign and opposite-sign stores from every registered sample.
    ///
    /// Samples which fail while reading are removed from the registry and from both stores.
    pub fn accumulate(&mut self) -> SsdlResult<AnalysisYields> {
        let (mut same_sign, ss_failed) = self
            .classifier
            .accumulate_all(&self.samples(), ChargeRelation::SameSign)?;
        let (mut opposite_sign, os_failed) = self
            .classifier
            .accumulate_all(&self.samples(), ChargeRelation::OppositeSign)?;
        let mut failed = ss_failed;
        for os in os_failed {
            if !failed.iter().any(|ss| ss.name == os.name) {
                failed.push(os);
            }
        }
        for excluded in &failed {
            for sample in self.registry.iter().filter(|s| s.name == excluded.name) {
                same_sign.remove_sample(&sample.sname);
                opposite_sign.remove_sample(&sample.sname);
            }
        }
        self.drop_failed(failed);
        Ok(AnalysisYields {
            same_sign,
            opposite_sign,
        })
    }

    fn aggregator(&self) -> PredictionAggregator {
        PredictionAggregator::new(&self.config)
    }

    /// Phase two: predict the background of `region` from the data samples.
    ///
    /// Pairs of the configured charge relation are predicted. Both passes are always
    /// accumulated, so the relation can be changed without reading the events again.
    pub fn predict(
        &self,
        yields: &AnalysisYields,
        region: &str,
    ) -> SsdlResult<CombinedPrediction> {
        let charge = self.charge();
        let store = yields.store(charge);
        let data = self.registry.data();
        let missing: Vec<_> = data
            .iter()
            .filter(|s| !store.contains_sample(&s.sname))
            .map(|s| s.sname.as_str())
            .collect();
        if !missing.is_empty() {
            warn!("No yields stored for data samples {:?}", missing);
        }
        let inputs = PredictionInputs {
            ratio_samples: &data,
            fake_samples: &data,
            observed_samples: &data,
            store,
            os_store: yields.charge_flip_source(charge),
        };
        let mut prediction = self.aggregator().predict(&inputs, region)?;
        prediction.excluded_samples = self.registry.excluded().to_vec();
        Ok(prediction)
    }

    /// Closure test: predict the background simulation from its own control regions.
    pub fn closure(
        &self,
        yields: &AnalysisYields,
        region: &str,
    ) -> SsdlResult<CombinedPrediction> {
        let background = self.registry.of_kind(SampleKind::Background);
        let charge = self.charge();
        self.aggregator().closure(
            &background,
            yields.store(charge),
            yields.charge_flip_source(charge),
            region,
        )
    }

    /// Predict `region` and render the text report.
    pub fn report(
        &self,
        yields: &AnalysisYields,
        region: &str,
        with_closure: bool,
        with_cutflow: bool,
    ) -> SsdlResult<String> {
        let prediction = self.predict(yields, region)?;
        let closure = if with_closure {
            Some(self.closure(yields, region)?)
        } else {
            None
        };
        let samples = self.samples();
        Ok(Report {
            prediction: &prediction,
            store: yields.store(self.charge()),
            samples: &samples,
            closure: closure.as_ref(),
            with_cutflow,
        }
        .to_string())
    }
}
