use auto_ops::impl_op_ex;
use serde::{Deserialize, Serialize};

use crate::{SsdlError, SsdlResult};

/// Useful enumerations for lepton flavors, channels, regions and sample kinds.
pub mod enums;
/// A minimal four-vector for invariant masses and angular distances.
pub mod vectors;

/// A helper method to get histogram edges from evenly-spaced `bins` over a given `range`
/// # See Also
/// [`BinnedAxis`]
pub fn get_bin_edges(bins: usize, range: (f64, f64)) -> Vec<f64> {
    let bin_width = (range.1 - range.0) / (bins as f64);
    (0..=bins)
        .map(|i| range.0 + (i as f64 * bin_width))
        .collect()
}

/// An axis with arbitrary, strictly increasing bin edges.
///
/// Values outside the edges are collected in the first or last bin, so every selected lepton
/// that is counted also lands in a bin. Only NaN has no bin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinnedAxis {
    edges: Vec<f64>,
}

impl BinnedAxis {
    /// Create an axis from its edges, checking that there is at least one bin and that the edges
    /// increase.
    pub fn new(edges: Vec<f64>) -> SsdlResult<Self> {
        if edges.len() < 2 {
            return Err(SsdlError::ConfigError {
                name: "binning".to_string(),
                reason: format!("need at least two edges, got {}", edges.len()),
            });
        }
        if edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SsdlError::ConfigError {
                name: "binning".to_string(),
                reason: format!("edges must be strictly increasing: {:?}", edges),
            });
        }
        Ok(Self { edges })
    }

    /// Evenly spaced axis with `bins` bins over `range`.
    pub fn uniform(bins: usize, range: (f64, f64)) -> SsdlResult<Self> {
        Self::new(get_bin_edges(bins, range))
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin index holding `value`, clamped to the edge bins. `None` for NaN.
    pub fn index(&self, value: f64) -> Option<usize> {
        if value.is_nan() {
            return None;
        }
        let n = self.n_bins();
        Some(
            self.edges[1..]
                .iter()
                .position(|&upper| value < upper)
                .unwrap_or(n - 1),
        )
    }

    /// Midpoint of bin `i`.
    pub fn center(&self, i: usize) -> f64 {
        0.5 * (self.edges[i] + self.edges[i + 1])
    }

    pub fn low_edge(&self, i: usize) -> f64 {
        self.edges[i]
    }

    pub fn high_edge(&self, i: usize) -> f64 {
        self.edges[i + 1]
    }
}

/// A weighted two-dimensional histogram with per-bin sums of squared weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hist2D {
    x: BinnedAxis,
    y: BinnedAxis,
    counts: Vec<f64>,
    sumw2: Vec<f64>,
}

impl Hist2D {
    pub fn new(x: BinnedAxis, y: BinnedAxis) -> Self {
        let n = x.n_bins() * y.n_bins();
        Self {
            x,
            y,
            counts: vec![0.0; n],
            sumw2: vec![0.0; n],
        }
    }

    pub fn x_axis(&self) -> &BinnedAxis {
        &self.x
    }

    pub fn y_axis(&self) -> &BinnedAxis {
        &self.y
    }

    fn flat(&self, i: usize, j: usize) -> usize {
        i * self.y.n_bins() + j
    }

    /// Add `weight` at `(x, y)`. Returns `false` only when a coordinate is NaN.
    pub fn fill(&mut self, x: f64, y: f64, weight: f64) -> bool {
        match (self.x.index(x), self.y.index(y)) {
            (Some(i), Some(j)) => {
                let k = self.flat(i, j);
                self.counts[k] += weight;
                self.sumw2[k] += weight * weight;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.counts[self.flat(i, j)]
    }

    /// Statistical error of bin `(i, j)` from the summed squared weights.
    pub fn error(&self, i: usize, j: usize) -> f64 {
        self.sumw2[self.flat(i, j)].sqrt()
    }

    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Multiply every bin by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            x: self.x.clone(),
            y: self.y.clone(),
            counts: self.counts.iter().map(|c| c * factor).collect(),
            sumw2: self.sumw2.iter().map(|w| w * factor * factor).collect(),
        }
    }

    pub fn same_binning(&self, other: &Hist2D) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl_op_ex!(+ |a: &Hist2D, b: &Hist2D| -> Hist2D {
    debug_assert!(a.same_binning(b), "histograms must share their binning to be added");
    Hist2D {
        x: a.x.clone(),
        y: a.y.clone(),
        counts: a.counts.iter().zip(&b.counts).map(|(l, r)| l + r).collect(),
        sumw2: a.sumw2.iter().zip(&b.sumw2).map(|(l, r)| l + r).collect(),
    }
});

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bin_edges() {
        let edges = get_bin_edges(5, (10.0, 60.0));
        assert_eq!(edges, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_axis_index() {
        let axis = BinnedAxis::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]).unwrap();
        assert_eq!(axis.n_bins(), 5);
        assert_eq!(axis.index(9.99), Some(0));
        assert_eq!(axis.index(-3.0), Some(0));
        assert_eq!(axis.index(10.0), Some(0));
        assert_eq!(axis.index(29.9), Some(1));
        assert_eq!(axis.index(59.9), Some(4));
        assert_eq!(axis.index(250.0), Some(4));
        assert_eq!(axis.index(f64::NAN), None);
        assert_relative_eq!(axis.center(2), 35.0);
    }

    #[test]
    fn test_axis_rejects_bad_edges() {
        assert!(BinnedAxis::new(vec![1.0]).is_err());
        assert!(BinnedAxis::new(vec![1.0, 1.0, 2.0]).is_err());
    }

    #[test]
    fn test_hist2d_fill_and_add() {
        let ax = BinnedAxis::uniform(2, (0.0, 2.0)).unwrap();
        let mut h = Hist2D::new(ax.clone(), ax.clone());
        assert!(h.fill(0.5, 1.5, 2.0));
        assert!(h.fill(0.5, 1.5, 1.0));
        assert!(!h.fill(f64::NAN, 1.5, 1.0));
        assert_relative_eq!(h.get(0, 1), 3.0);
        assert_relative_eq!(h.error(0, 1), 5.0_f64.sqrt());
        let sum = &h + &h.scaled(2.0);
        assert_relative_eq!(sum.get(0, 1), 9.0);
        assert_relative_eq!(sum.integral(), 9.0);
    }

    #[test]
    fn test_hist2d_keeps_out_of_range_weight() {
        let pt = BinnedAxis::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]).unwrap();
        let mut h = Hist2D::new(pt.clone(), pt);
        assert!(h.fill(30.0, 7.0, 1.0));
        assert!(h.fill(4.0, 75.0, 0.5));
        assert_relative_eq!(h.get(2, 0), 1.0);
        assert_relative_eq!(h.get(0, 4), 0.5);
        assert_relative_eq!(h.integral(), 1.5);
    }
}
