#[cfg(feature = "rayon")]
use accurate::{sum::Klein, traits::*};
use log::debug;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use std::fmt::Display;

use ssdl_core::{
    config::UncertaintyModel, BinnedAxis, ControlRegion, Flavor, Hist2D, Sample, SsdlError,
    SsdlResult, YieldStore,
};

/// The uncertainty attached to a [`Ratio`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RatioError {
    Symmetric(f64),
    Asymmetric { up: f64, low: f64 },
}

/// A tight-to-loose ratio with its uncertainty.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    pub value: f64,
    pub error: RatioError,
}

impl Ratio {
    pub fn symmetric(value: f64, error: f64) -> Self {
        Self {
            value,
            error: RatioError::Symmetric(error),
        }
    }

    pub fn err_up(&self) -> f64 {
        match self.error {
            RatioError::Symmetric(e) => e,
            RatioError::Asymmetric { up, .. } => up,
        }
    }

    pub fn err_low(&self) -> f64 {
        match self.error {
            RatioError::Symmetric(e) => e,
            RatioError::Asymmetric { low, .. } => low,
        }
    }

    /// A single one-sigma width used to shift the ratio when propagating uncertainties. For
    /// asymmetric intervals this is the larger side.
    pub fn sigma(&self) -> f64 {
        self.err_up().max(self.err_low())
    }

    /// Add an absolute systematic uncertainty in quadrature to both sides.
    pub fn with_systematic(&self, syst: f64) -> Self {
        if syst == 0.0 {
            return *self;
        }
        let error = match self.error {
            RatioError::Symmetric(e) => RatioError::Symmetric(e.hypot(syst)),
            RatioError::Asymmetric { up, low } => RatioError::Asymmetric {
                up: up.hypot(syst),
                low: low.hypot(syst),
            },
        };
        Self {
            value: self.value,
            error,
        }
    }
}

impl Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.error {
            RatioError::Symmetric(e) => write!(f, "{:.3} +/- {:.3}", self.value, e),
            RatioError::Asymmetric { up, low } => {
                write!(f, "{:.3} +{:.3} -{:.3}", self.value, up, low)
            }
        }
    }
}

fn check_counts(tight: f64, loose: f64, what: &str) -> SsdlResult<()> {
    if loose == 0.0 {
        return Err(SsdlError::ZeroDenominator {
            what: what.to_string(),
        });
    }
    if tight < 0.0 || loose < 0.0 || tight > loose {
        return Err(SsdlError::Custom(format!(
            "Invalid {} counts: tight = {}, loose = {}",
            what, tight, loose
        )));
    }
    Ok(())
}

/// `t/l` with binomial error `sqrt(t (1 - t/l)) / l`.
pub fn ratio_with_binom_errors(tight: f64, loose: f64) -> SsdlResult<Ratio> {
    check_counts(tight, loose, "binomial")?;
    let value = tight / loose;
    Ok(Ratio::symmetric(value, (tight * (1.0 - value)).sqrt() / loose))
}

/// `t/l` with the error of a ratio of independent Poisson counts, `sqrt(t^2 (l + t) / l^3)`.
pub fn ratio_with_poiss_errors(tight: f64, loose: f64) -> SsdlResult<Ratio> {
    check_counts(tight, loose, "poisson")?;
    Ok(Ratio::symmetric(
        tight / loose,
        (tight * tight * (loose + tight) / loose.powi(3)).sqrt(),
    ))
}

/// `t/l` with the exact Clopper-Pearson interval at confidence level `cl`.
///
/// The lower error is zero when `t = 0` and the upper error is zero when `t = l`.
pub fn ratio_with_clopper_pearson(tight: f64, loose: f64, cl: f64) -> SsdlResult<Ratio> {
    check_counts(tight, loose, "Clopper-Pearson")?;
    let alpha = 0.5 * (1.0 - cl);
    let value = tight / loose;
    let lower = if tight == 0.0 {
        0.0
    } else {
        Beta::new(tight, loose - tight + 1.0)?.inverse_cdf(alpha)
    };
    let upper = if tight == loose {
        1.0
    } else {
        Beta::new(tight + 1.0, loose - tight)?.inverse_cdf(1.0 - alpha)
    };
    Ok(Ratio {
        value,
        error: RatioError::Asymmetric {
            up: upper - value,
            low: value - lower,
        },
    })
}

/// `t/l` with the central interval of the `Beta(t + alpha, l - t + beta)` posterior.
///
/// The interval is clipped to contain the point estimate.
pub fn ratio_with_bayesian(
    tight: f64,
    loose: f64,
    cl: f64,
    prior_alpha: f64,
    prior_beta: f64,
) -> SsdlResult<Ratio> {
    check_counts(tight, loose, "Bayesian")?;
    let value = tight / loose;
    let posterior = Beta::new(tight + prior_alpha, loose - tight + prior_beta)?;
    let alpha = 0.5 * (1.0 - cl);
    let lower = posterior.inverse_cdf(alpha).min(value);
    let upper = posterior.inverse_cdf(1.0 - alpha).max(value);
    Ok(Ratio {
        value,
        error: RatioError::Asymmetric {
            up: upper - value,
            low: value - lower,
        },
    })
}

/// Dispatch on an [`UncertaintyModel`].
pub fn ratio_with_model(tight: f64, loose: f64, model: &UncertaintyModel) -> SsdlResult<Ratio> {
    match *model {
        UncertaintyModel::Binomial => ratio_with_binom_errors(tight, loose),
        UncertaintyModel::Poisson => ratio_with_poiss_errors(tight, loose),
        UncertaintyModel::ClopperPearson { confidence_level } => {
            ratio_with_clopper_pearson(tight, loose, confidence_level)
        }
        UncertaintyModel::Bayesian {
            confidence_level,
            alpha,
            beta,
        } => ratio_with_bayesian(tight, loose, confidence_level, alpha, beta),
    }
}

/// The content of one ratio-map bin.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RatioValue {
    Defined(Ratio),
    /// The bin had no loose entries.
    Undefined,
}

/// A tight-to-loose ratio binned in (pt, eta).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatioMap {
    pub flavor: Flavor,
    pub kind: ControlRegion,
    pt: BinnedAxis,
    eta: BinnedAxis,
    bins: Vec<RatioValue>,
}

impl RatioMap {
    /// A map with the same ratio in every bin.
    pub fn uniform(
        flavor: Flavor,
        kind: ControlRegion,
        pt: BinnedAxis,
        eta: BinnedAxis,
        ratio: Ratio,
    ) -> Self {
        let n = pt.n_bins() * eta.n_bins();
        Self {
            flavor,
            kind,
            pt,
            eta,
            bins: vec![RatioValue::Defined(ratio); n],
        }
    }

    /// Divide the tight map by the loose map bin by bin.
    ///
    /// Bins without loose entries are undefined, except when `empty_default` is given (the
    /// prompt-ratio convention), which then also replaces bins without tight entries.
    pub fn from_histograms(
        flavor: Flavor,
        kind: ControlRegion,
        tight: &Hist2D,
        loose: &Hist2D,
        model: &UncertaintyModel,
        empty_default: Option<Ratio>,
    ) -> SsdlResult<Self> {
        if !tight.same_binning(loose) {
            return Err(SsdlError::Custom(format!(
                "{} {} maps: tight and loose binning differ",
                flavor, kind
            )));
        }
        let (pt, eta) = (tight.x_axis().clone(), tight.y_axis().clone());
        let mut bins = Vec::with_capacity(pt.n_bins() * eta.n_bins());
        for i in 0..pt.n_bins() {
            for j in 0..eta.n_bins() {
                let (t, l) = (tight.get(i, j), loose.get(i, j));
                let value = match empty_default {
                    Some(default) if l == 0.0 || t == 0.0 => RatioValue::Defined(default),
                    _ if l == 0.0 => RatioValue::Undefined,
                    _ => RatioValue::Defined(ratio_with_model(t, l, model)?),
                };
                bins.push(value);
            }
        }
        Ok(Self {
            flavor,
            kind,
            pt,
            eta,
            bins,
        })
    }

    pub fn pt_axis(&self) -> &BinnedAxis {
        &self.pt
    }

    pub fn eta_axis(&self) -> &BinnedAxis {
        &self.eta
    }

    pub fn bin(&self, i: usize, j: usize) -> RatioValue {
        self.bins[i * self.eta.n_bins() + j]
    }

    /// The ratio of the bin containing `(pt, eta)`, with out-of-range values read from the
    /// edge bins.
    pub fn lookup(&self, pt: f64, eta: f64) -> SsdlResult<Ratio> {
        let undefined = || SsdlError::UndefinedRatio {
            what: format!("{} {}", self.flavor, self.kind),
            pt,
            eta,
        };
        let (Some(i), Some(j)) = (self.pt.index(pt), self.eta.index(eta)) else {
            return Err(undefined());
        };
        match self.bin(i, j) {
            RatioValue::Defined(ratio) => Ok(ratio),
            RatioValue::Undefined => Err(undefined()),
        }
    }

    /// Add an absolute systematic in quadrature to every defined bin.
    pub fn with_systematic(mut self, syst: f64) -> Self {
        for bin in self.bins.iter_mut() {
            if let RatioValue::Defined(ratio) = bin {
                *ratio = ratio.with_systematic(syst);
            }
        }
        self
    }
}

/// Pools control-region counts over samples and turns them into ratios.
#[derive(Clone, Debug, Default)]
pub struct RatioEstimator {
    model: UncertaintyModel,
}

impl RatioEstimator {
    pub fn new(model: UncertaintyModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &UncertaintyModel {
        &self.model
    }

    /// Tight and loose sums of a control region over `samples`, each scaled by its
    /// normalization.
    pub fn pooled_counts(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
        flavor: Flavor,
        kind: ControlRegion,
    ) -> (f64, f64) {
        let counts = |sample: &&Sample| {
            let (t, l) = store
                .numbers(&sample.sname, region, flavor.control_channel())
                .control(kind);
            (t * sample.scale(), l * sample.scale())
        };
        #[cfg(feature = "rayon")]
        {
            let tight = samples
                .par_iter()
                .map(|s| counts(s).0)
                .parallel_sum_with_accumulator::<Klein<f64>>();
            let loose = samples
                .par_iter()
                .map(|s| counts(s).1)
                .parallel_sum_with_accumulator::<Klein<f64>>();
            (tight, loose)
        }
        #[cfg(not(feature = "rayon"))]
        {
            let tight = samples.iter().map(|s| counts(s).0).sum();
            let loose = samples.iter().map(|s| counts(s).1).sum();
            (tight, loose)
        }
    }

    /// The pooled ratio `sum(t) / sum(l)` of a control region.
    ///
    /// An empty denominator is an error rather than NaN.
    pub fn compute(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
        flavor: Flavor,
        kind: ControlRegion,
    ) -> SsdlResult<Ratio> {
        let (tight, loose) = self.pooled_counts(samples, store, region, flavor, kind);
        debug!(
            "{} {} in {}: tight = {}, loose = {}",
            flavor, kind, region, tight, loose
        );
        ratio_with_model(tight, loose, &self.model).map_err(|err| match err {
            SsdlError::ZeroDenominator { .. } => SsdlError::ZeroDenominator {
                what: format!("{} {} in {}", flavor, kind, region),
            },
            other => other,
        })
    }

    /// The pooled ratio binned in (pt, eta).
    pub fn compute_map(
        &self,
        samples: &[&Sample],
        store: &YieldStore,
        region: &str,
        flavor: Flavor,
        kind: ControlRegion,
        empty_default: Option<Ratio>,
    ) -> SsdlResult<RatioMap> {
        let mut tight = Hist2D::new(store.pt_axis().clone(), store.eta_axis().clone());
        let mut loose = tight.clone();
        for sample in samples {
            if let Some(yields) = store.get(&sample.sname, region, flavor.control_channel()) {
                let (t, l) = yields.histograms.control(kind);
                tight = &tight + &t.scaled(sample.scale());
                loose = &loose + &l.scaled(sample.scale());
            }
        }
        RatioMap::from_histograms(flavor, kind, &tight, &loose, &self.model, empty_default)
    }
}
