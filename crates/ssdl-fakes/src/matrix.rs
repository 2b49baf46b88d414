use std::fmt::Display;

use auto_ops::impl_op_ex;
use log::{debug, warn};
use nalgebra::{Matrix2, Matrix3, Matrix4, SMatrix, SVector, Vector3, Vector4};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use ssdl_core::{
    config::{RatioConfig, SystematicMode},
    yields::YieldHistograms,
    BinnedAxis, Channel, Flavor, SsdlError, SsdlResult,
};

use crate::ratio::{Ratio, RatioMap};

/// The lepton-flavor structure of a pair, which fixes the shape of the linear system.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// Two leptons of the same flavor. The legs are interchangeable, so the one-fake
    /// components are merged and the system has three unknowns.
    SameFlavor(Flavor),
    /// One muon (leg 1) and one electron (leg 2), with four unknowns.
    MixedFlavor,
}

impl Topology {
    pub fn of_channel(channel: Channel) -> Self {
        match channel {
            Channel::MuMu => Topology::SameFlavor(Flavor::Muon),
            Channel::ElEl => Topology::SameFlavor(Flavor::Electron),
            Channel::ElMu => Topology::MixedFlavor,
        }
    }

    pub fn n_components(&self) -> usize {
        match self {
            Topology::SameFlavor(_) => 3,
            Topology::MixedFlavor => 4,
        }
    }

    /// Labels of the origin components, in solution order.
    pub fn component_labels(&self) -> &'static [&'static str] {
        match self {
            Topology::SameFlavor(_) => &["Npp", "Nf", "Nff"],
            Topology::MixedFlavor => &["Npp", "Npf", "Nfp", "Nff"],
        }
    }

    /// Flavors of leg 1 and leg 2.
    pub fn flavors(&self) -> [Flavor; 2] {
        match self {
            Topology::SameFlavor(flavor) => [*flavor, *flavor],
            Topology::MixedFlavor => [Flavor::Muon, Flavor::Electron],
        }
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::SameFlavor(flavor) => write!(f, "{}{}", flavor, flavor),
            Topology::MixedFlavor => write!(f, "MuEl"),
        }
    }
}

/// Prompt and fake ratios of one leg with their one-sigma widths.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LegRatios {
    pub p: f64,
    pub p_err: f64,
    pub f: f64,
    pub f_err: f64,
}

impl LegRatios {
    pub fn new(p: f64, p_err: f64, f: f64, f_err: f64) -> Self {
        Self { p, p_err, f, f_err }
    }

    pub fn from_ratios(prompt: &Ratio, fake: &Ratio) -> Self {
        Self::new(prompt.value, prompt.sigma(), fake.value, fake.sigma())
    }
}

/// Observed pair counts by tightness of (leg 1, leg 2).
///
/// For same-flavor pairs the one-tight count is kept in `ntl` and `nlt` is zero; both are
/// summed before solving so either split gives the same answer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedCounts {
    pub ntt: f64,
    pub ntl: f64,
    pub nlt: f64,
    pub nll: f64,
}

impl ObservedCounts {
    pub fn new(ntt: f64, ntl: f64, nlt: f64, nll: f64) -> Self {
        Self { ntt, ntl, nlt, nll }
    }

    pub fn from_numbers(numbers: &ssdl_core::NumberSet) -> Self {
        Self::new(numbers.nt2, numbers.nt10, numbers.nt01, numbers.nt0)
    }

    pub fn is_empty(&self) -> bool {
        self.ntt == 0.0 && self.ntl == 0.0 && self.nlt == 0.0 && self.nll == 0.0
    }

    fn same_flavor(&self) -> Vector3<f64> {
        Vector3::new(self.ntt, self.ntl + self.nlt, self.nll)
    }

    fn mixed_flavor(&self) -> Vector4<f64> {
        Vector4::new(self.ntt, self.ntl, self.nlt, self.nll)
    }
}

/// A predicted count with separate statistical and systematic uncertainties.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub stat: f64,
    pub syst: f64,
}

impl Estimate {
    pub fn new(value: f64, stat: f64, syst: f64) -> Self {
        Self { value, stat, syst }
    }

    /// Statistical and systematic uncertainties added in quadrature.
    pub fn total_error(&self) -> f64 {
        self.stat.hypot(self.syst)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            value: self.value * factor,
            stat: self.stat * factor.abs(),
            syst: self.syst * factor.abs(),
        }
    }
}

impl Display for Estimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2} +/- {:.2} (stat) +/- {:.2} (syst)",
            self.value, self.stat, self.syst
        )
    }
}

impl_op_ex!(+ |a: &Estimate, b: &Estimate| -> Estimate {
    Estimate {
        value: a.value + b.value,
        stat: a.stat.hypot(b.stat),
        syst: a.syst.hypot(b.syst),
    }
});

/// A set of component estimates together with the one-fake, two-fake and total-fake sums.
///
/// The sums are computed from the linear system directly, so their uncertainties include the
/// correlations between components.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologySolution {
    pub components: Vec<Estimate>,
    pub one_fake: Estimate,
    pub two_fake: Estimate,
    pub fake: Estimate,
}

impl TopologySolution {
    pub fn zero(topology: Topology) -> Self {
        Self {
            components: vec![Estimate::default(); topology.n_components()],
            one_fake: Estimate::default(),
            two_fake: Estimate::default(),
            fake: Estimate::default(),
        }
    }

    pub fn npp(&self) -> Estimate {
        self.components[0]
    }

    pub fn nff(&self) -> Estimate {
        self.components[self.components.len() - 1]
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            components: self.components.iter().map(|c| c.scaled(factor)).collect(),
            one_fake: self.one_fake.scaled(factor),
            two_fake: self.two_fake.scaled(factor),
            fake: self.fake.scaled(factor),
        }
    }
}

impl_op_ex!(+ |a: &TopologySolution, b: &TopologySolution| -> TopologySolution {
    debug_assert_eq!(a.components.len(), b.components.len());
    TopologySolution {
        components: a.components.iter().zip(&b.components).map(|(x, y)| x + y).collect(),
        one_fake: a.one_fake + b.one_fake,
        two_fake: a.two_fake + b.two_fake,
        fake: a.fake + b.fake,
    }
});

/// The decomposition of a pair sample by origin, and its projection into the tight-tight
/// category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FakeRateSolution {
    pub topology: Topology,
    /// Estimated number of pairs of each origin among all loose pairs.
    pub origin: TopologySolution,
    /// Contribution of each origin to the tight-tight count.
    pub tight_tight: TopologySolution,
}

impl FakeRateSolution {
    pub fn zero(topology: Topology) -> Self {
        Self {
            topology,
            origin: TopologySolution::zero(topology),
            tight_tight: TopologySolution::zero(topology),
        }
    }

    /// Predicted number of tight-tight pairs with at least one fake lepton.
    pub fn predicted_fake(&self) -> Estimate {
        self.tight_tight.fake
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            topology: self.topology,
            origin: self.origin.scaled(factor),
            tight_tight: self.tight_tight.scaled(factor),
        }
    }
}

impl_op_ex!(+ |a: &FakeRateSolution, b: &FakeRateSolution| -> FakeRateSolution {
    FakeRateSolution {
        topology: a.topology,
        origin: &a.origin + &b.origin,
        tight_tight: &a.tight_tight + &b.tight_tight,
    }
});

/// A (pt1, pt2) bin which could not be solved.
#[derive(Clone, Debug)]
pub struct ExcludedBin {
    pub leg1_bin: usize,
    pub leg2_bin: usize,
    pub pt1: f64,
    pub pt2: f64,
    pub reason: SsdlError,
}

impl Display for ExcludedBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bin ({}, {}) at pt = ({:.1}, {:.1}): {}",
            self.leg1_bin, self.leg2_bin, self.pt1, self.pt2, self.reason
        )
    }
}

/// Prompt and fake ratio maps used for one leg.
#[derive(Copy, Clone, Debug)]
pub struct LegMaps<'a> {
    pub prompt: &'a RatioMap,
    pub fake: &'a RatioMap,
}

/// Solutions summed over the leg-2 pt bins, binned in leg-1 pt.
#[derive(Clone, Debug)]
pub struct BinnedSolution {
    pub topology: Topology,
    pub axis: BinnedAxis,
    pub bins: Vec<FakeRateSolution>,
    pub total: FakeRateSolution,
    pub excluded: Vec<ExcludedBin>,
}

/// (p1, f1, p2, f2)
type Point = [f64; 4];

fn leg_matrix(p: f64, f: f64) -> Matrix2<f64> {
    Matrix2::new(p, f, 1.0 - p, 1.0 - f)
}

/// Rows (tt, t1, ll), columns (pp, one fake, ff). The one-fake column averages the two
/// assignments of the fake leg so that it stays exact when both legs share their ratios.
fn same_flavor_system(x: &Point) -> Matrix3<f64> {
    let [p1, f1, p2, f2] = *x;
    Matrix3::new(
        p1 * p2,
        0.5 * (p1 * f2 + f1 * p2),
        f1 * f2,
        p1 * (1.0 - p2) + (1.0 - p1) * p2,
        0.5 * (p1 * (1.0 - f2) + (1.0 - p1) * f2 + f1 * (1.0 - p2) + (1.0 - f1) * p2),
        f1 * (1.0 - f2) + (1.0 - f1) * f2,
        (1.0 - p1) * (1.0 - p2),
        0.5 * ((1.0 - p1) * (1.0 - f2) + (1.0 - f1) * (1.0 - p2)),
        (1.0 - f1) * (1.0 - f2),
    )
}

/// Rows (tt, tl, lt, ll), columns (pp, pf, fp, ff): the Kronecker product of the leg matrices.
fn mixed_flavor_system(x: &Point) -> Matrix4<f64> {
    let (a, b) = (leg_matrix(x[0], x[1]), leg_matrix(x[2], x[3]));
    Matrix4::from_fn(|r, c| a[(r / 2, c / 2)] * b[(r % 2, c % 2)])
}

/// Weight vectors over the origin components: each component, the one-fake sum, the two-fake
/// count and the total fake sum, first as origin counts and then as tight-tight contributions.
fn projections<const D: usize>(
    matrix: &SMatrix<f64, D, D>,
    one_fake: &[usize],
) -> Vec<SVector<f64, D>> {
    let unit = |k: usize| SVector::<f64, D>::from_fn(|r, _| if r == k { 1.0 } else { 0.0 });
    let mut origin: Vec<SVector<f64, D>> = (0..D).map(unit).collect();
    let one = one_fake
        .iter()
        .fold(SVector::<f64, D>::zeros(), |acc, &k| acc + unit(k));
    let two = unit(D - 1);
    let fake = one + two;
    origin.extend([one, two, fake]);
    let tt_row = matrix.row(0).transpose();
    let tight_tight: Vec<_> = origin.iter().map(|w| w.component_mul(&tt_row)).collect();
    origin.extend(tight_tight);
    origin
}

/// Solves the matrix-method linear system which relates loose pairs of prompt and fake origin
/// to the observed tight/loose categories.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FakeRateMatrixSolver {
    tolerance: f64,
    mode: SystematicMode,
}

impl Default for FakeRateMatrixSolver {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            mode: SystematicMode::PerParameter,
        }
    }
}

impl FakeRateMatrixSolver {
    pub fn new(tolerance: f64, mode: SystematicMode) -> Self {
        Self { tolerance, mode }
    }

    pub fn from_config(config: &RatioConfig) -> Self {
        Self::new(config.singular_tolerance, config.systematic_mode)
    }

    fn check_point(&self, point: &Point) -> SsdlResult<()> {
        for leg in 0..2 {
            let (p, f) = (point[2 * leg], point[2 * leg + 1]);
            if p.is_nan() || f.is_nan() || (p - f).abs() < self.tolerance {
                return Err(SsdlError::SingularMatrix { leg: leg + 1, p, f });
            }
        }
        Ok(())
    }

    /// Expected observed counts for the given origin counts, in component order.
    pub fn forward(
        &self,
        topology: Topology,
        legs: &[LegRatios; 2],
        origin: &[f64],
    ) -> SsdlResult<ObservedCounts> {
        if origin.len() != topology.n_components() {
            return Err(SsdlError::Custom(format!(
                "{} expects {} origin components, got {}",
                topology,
                topology.n_components(),
                origin.len()
            )));
        }
        let point = [legs[0].p, legs[0].f, legs[1].p, legs[1].f];
        Ok(match topology {
            Topology::SameFlavor(_) => {
                let n = same_flavor_system(&point) * Vector3::from_column_slice(origin);
                ObservedCounts::new(n[0], n[1], 0.0, n[2])
            }
            Topology::MixedFlavor => {
                let n = mixed_flavor_system(&point) * Vector4::from_column_slice(origin);
                ObservedCounts::new(n[0], n[1], n[2], n[3])
            }
        })
    }

    /// Decompose observed counts by origin and project back into the tight-tight category.
    ///
    /// Statistical errors treat each observed count as an independent Poisson variable.
    /// Systematic errors come from re-solving with the ratios shifted by one sigma. When both
    /// legs of a same-flavor pair use identical ratios, the shared prompt and fake ratios are
    /// shifted on both legs together. A shift that makes the system singular is skipped with a
    /// warning and contributes nothing to the systematic error; only a singular nominal point
    /// fails the solve.
    pub fn solve(
        &self,
        topology: Topology,
        legs: &[LegRatios; 2],
        counts: &ObservedCounts,
    ) -> SsdlResult<FakeRateSolution> {
        match topology {
            Topology::SameFlavor(_) => {
                self.solve_system(topology, same_flavor_system, &[1], legs, counts.same_flavor())
            }
            Topology::MixedFlavor => self.solve_system(
                topology,
                mixed_flavor_system,
                &[1, 2],
                legs,
                counts.mixed_flavor(),
            ),
        }
    }

    fn evaluate<const D: usize>(
        &self,
        build: fn(&Point) -> SMatrix<f64, D, D>,
        one_fake: &[usize],
        point: &Point,
        counts: &SVector<f64, D>,
    ) -> SsdlResult<(Vec<f64>, Vec<f64>)> {
        let matrix = build(point);
        let inverse = matrix.try_inverse().ok_or_else(|| {
            SsdlError::Custom(format!("coefficient matrix at {:?} is not invertible", point))
        })?;
        let origin = inverse * counts;
        let inverse_t = inverse.transpose();
        Ok(projections(&matrix, one_fake)
            .iter()
            .map(|w| {
                let r = inverse_t * w;
                let stat = r
                    .iter()
                    .zip(counts.iter())
                    .map(|(rj, nj)| rj * rj * nj.max(0.0))
                    .sum::<f64>()
                    .sqrt();
                (w.dot(&origin), stat)
            })
            .unzip())
    }

    fn shifted_points(&self, topology: Topology, legs: &[LegRatios; 2]) -> Vec<Point> {
        let point = [legs[0].p, legs[0].f, legs[1].p, legs[1].f];
        let sigma = [legs[0].p_err, legs[0].f_err, legs[1].p_err, legs[1].f_err];
        let shared = matches!(topology, Topology::SameFlavor(_)) && legs[0] == legs[1];
        let groups: Vec<Vec<usize>> = match (self.mode, shared) {
            (SystematicMode::Combined, _) => vec![vec![0, 1, 2, 3]],
            (SystematicMode::PerParameter, true) => vec![vec![0, 2], vec![1, 3]],
            (SystematicMode::PerParameter, false) => vec![vec![0], vec![1], vec![2], vec![3]],
        };
        groups
            .into_iter()
            .filter(|group| group.iter().any(|&k| sigma[k] > 0.0))
            .map(|group| {
                let mut shifted = point;
                for k in group {
                    shifted[k] = (shifted[k] + sigma[k]).clamp(0.0, 1.0);
                }
                shifted
            })
            .collect()
    }

    fn solve_system<const D: usize>(
        &self,
        topology: Topology,
        build: fn(&Point) -> SMatrix<f64, D, D>,
        one_fake: &[usize],
        legs: &[LegRatios; 2],
        counts: SVector<f64, D>,
    ) -> SsdlResult<FakeRateSolution> {
        let point = [legs[0].p, legs[0].f, legs[1].p, legs[1].f];
        self.check_point(&point)?;
        let (values, stats) = self.evaluate(build, one_fake, &point, &counts)?;
        let mut syst2 = vec![0.0; values.len()];
        for shifted in self.shifted_points(topology, legs) {
            let shifted_values = match self
                .check_point(&shifted)
                .and_then(|_| self.evaluate(build, one_fake, &shifted, &counts))
            {
                Ok((shifted_values, _)) => shifted_values,
                Err(e) => {
                    warn!("{} systematic shift to {:?} skipped: {}", topology, shifted, e);
                    continue;
                }
            };
            for (s2, (v, sv)) in syst2.iter_mut().zip(values.iter().zip(shifted_values)) {
                *s2 += (sv - v).powi(2);
            }
        }
        let estimates: Vec<Estimate> = values
            .iter()
            .zip(stats)
            .zip(syst2)
            .map(|((&value, stat), s2)| Estimate::new(value, stat, s2.sqrt()))
            .collect();
        let block = |offset: usize| TopologySolution {
            components: estimates[offset..offset + D].to_vec(),
            one_fake: estimates[offset + D],
            two_fake: estimates[offset + D + 1],
            fake: estimates[offset + D + 2],
        };
        let solution = FakeRateSolution {
            topology,
            origin: block(0),
            tight_tight: block(D + 3),
        };
        debug!(
            "{} solution: fake in tight-tight = {}",
            topology,
            solution.predicted_fake()
        );
        Ok(solution)
    }

    fn solve_cell(
        &self,
        topology: Topology,
        legs: &[LegMaps; 2],
        pts: [f64; 2],
        eta: f64,
        counts: &ObservedCounts,
    ) -> SsdlResult<FakeRateSolution> {
        let mut ratios = [LegRatios::default(); 2];
        for ((ratio, maps), pt) in ratios.iter_mut().zip(legs).zip(pts) {
            *ratio =
                LegRatios::from_ratios(&maps.prompt.lookup(pt, eta)?, &maps.fake.lookup(pt, eta)?);
        }
        self.solve(topology, &ratios, counts)
    }

    /// Solve every (leg-1 pt, leg-2 pt) bin with the ratios looked up at the bin centers and
    /// at `reference_eta`, then sum the solutions into leg-1 pt bins.
    ///
    /// Empty bins are skipped. Bins with an undefined ratio or a degenerate system are
    /// collected in [`BinnedSolution::excluded`] and left out of the sums.
    pub fn solve_binned(
        &self,
        topology: Topology,
        legs: [LegMaps; 2],
        histograms: &YieldHistograms,
        reference_eta: f64,
    ) -> SsdlResult<BinnedSolution> {
        let pairs = [
            &histograms.nt2,
            &histograms.nt10,
            &histograms.nt01,
            &histograms.nt0,
        ];
        if pairs.iter().any(|h| !h.same_binning(&histograms.nt2)) {
            return Err(SsdlError::Custom(format!(
                "{} pair histograms have inconsistent binning",
                topology
            )));
        }
        let axis1 = histograms.nt2.x_axis().clone();
        let axis2 = histograms.nt2.y_axis().clone();
        let cells: Vec<(usize, usize)> = (0..axis1.n_bins())
            .flat_map(|i| (0..axis2.n_bins()).map(move |j| (i, j)))
            .filter(|&(i, j)| pairs.iter().any(|h| h.get(i, j) != 0.0))
            .collect();
        let solve_cell = |&(i, j): &(usize, usize)| {
            let counts = ObservedCounts::new(
                histograms.nt2.get(i, j),
                histograms.nt10.get(i, j),
                histograms.nt01.get(i, j),
                histograms.nt0.get(i, j),
            );
            let pts = [axis1.center(i), axis2.center(j)];
            (i, j, self.solve_cell(topology, &legs, pts, reference_eta, &counts))
        };
        #[cfg(feature = "rayon")]
        let results: Vec<_> = cells.par_iter().map(solve_cell).collect();
        #[cfg(not(feature = "rayon"))]
        let results: Vec<_> = cells.iter().map(solve_cell).collect();

        let mut bins = vec![FakeRateSolution::zero(topology); axis1.n_bins()];
        let mut excluded = Vec::new();
        for (i, j, result) in results {
            match result {
                Ok(solution) => bins[i] = &bins[i] + &solution,
                Err(reason) => {
                    let bin = ExcludedBin {
                        leg1_bin: i,
                        leg2_bin: j,
                        pt1: axis1.center(i),
                        pt2: axis2.center(j),
                        reason,
                    };
                    warn!("{} excluded {}", topology, bin);
                    excluded.push(bin);
                }
            }
        }
        let total = bins
            .iter()
            .fold(FakeRateSolution::zero(topology), |acc, bin| &acc + bin);
        Ok(BinnedSolution {
            topology,
            axis: axis1,
            bins,
            total,
            excluded,
        })
    }
}
