use auto_ops::impl_op_ex;
use serde::{Deserialize, Serialize};

/// A Lorentz four-vector `(px, py, pz, E)` in GeV.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl Vec4 {
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    /// Build a four-vector from collider coordinates and a rest mass.
    pub fn from_pt_eta_phi_m(pt: f64, eta: f64, phi: f64, m: f64) -> Self {
        let px = pt * phi.cos();
        let py = pt * phi.sin();
        let pz = pt * eta.sinh();
        let e = (px * px + py * py + pz * pz + m * m).sqrt();
        Self { px, py, pz, e }
    }

    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    pub fn m2(&self) -> f64 {
        self.e * self.e - self.px * self.px - self.py * self.py - self.pz * self.pz
    }

    /// Invariant mass; slightly negative `m2` from rounding is clamped to zero.
    pub fn m(&self) -> f64 {
        self.m2().max(0.0).sqrt()
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4::new(a.px + b.px, a.py + b.py, a.pz + b.pz, a.e + b.e)
});
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4::new(a.px - b.px, a.py - b.py, a.pz - b.pz, a.e - b.e)
});

/// Azimuthal separation folded into `[-pi, pi)`.
pub fn delta_phi(phi1: f64, phi2: f64) -> f64 {
    let mut dphi = phi1 - phi2;
    while dphi >= std::f64::consts::PI {
        dphi -= 2.0 * std::f64::consts::PI;
    }
    while dphi < -std::f64::consts::PI {
        dphi += 2.0 * std::f64::consts::PI;
    }
    dphi
}

/// Angular distance in the `(eta, phi)` plane.
pub fn delta_r(eta1: f64, phi1: f64, eta2: f64, phi2: f64) -> f64 {
    (eta1 - eta2).hypot(delta_phi(phi1, phi2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mass_of_sum() {
        // back-to-back massless legs of 45.6 GeV give m = 91.2
        let a = Vec4::from_pt_eta_phi_m(45.6, 0.0, 0.0, 0.0);
        let b = Vec4::from_pt_eta_phi_m(45.6, 0.0, std::f64::consts::PI, 0.0);
        assert_relative_eq!((a + b).m(), 91.2, epsilon = 1e-9);
        assert_relative_eq!((&a + &b).pt(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rest_mass_kept() {
        let mu = Vec4::from_pt_eta_phi_m(20.0, 1.3, 0.4, 0.1057);
        assert_relative_eq!(mu.m(), 0.1057, epsilon = 1e-6);
        assert_relative_eq!(mu.pt(), 20.0, epsilon = 1e-12);
        let diff = mu - mu;
        assert_relative_eq!(diff.e, 0.0);
    }

    #[test]
    fn test_delta_r_wraps_phi() {
        let dr = delta_r(0.0, 3.1, 0.0, -3.1);
        assert_relative_eq!(dr, 2.0 * std::f64::consts::PI - 6.2, epsilon = 1e-12);
        assert_relative_eq!(delta_r(0.5, 0.0, -0.5, 0.0), 1.0, epsilon = 1e-12);
    }
}
