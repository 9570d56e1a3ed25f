//! Derivative-free Nelder–Mead simplex minimizer over fixed-size parameter vectors.
//!
//! Always terminates: either the simplex collapses below `xatol`/`fatol` or the
//! iteration cap is reached. Non-finite cost values are treated as +∞.

use nalgebra::SVector;

use crate::config::OptimizerConfig;

#[derive(Clone, Debug)]
pub struct Minimization<const N: usize> {
    /// Best vertex found
    pub params: SVector<f64, N>,
    /// Cost at `params`
    pub cost: f64,
    pub iterations: usize,
    pub evaluations: usize,
    /// True when the tolerance test passed before the iteration cap
    pub converged: bool,
}

/// Reflection, expansion, contraction and shrink coefficients.
#[derive(Clone, Copy, Debug)]
struct Coefficients {
    rho: f64,
    chi: f64,
    psi: f64,
    sigma: f64,
}

impl Coefficients {
    fn standard() -> Self {
        Self { rho: 1.0, chi: 2.0, psi: 0.5, sigma: 0.5 }
    }

    /// Gao & Han (2012) dimension-dependent coefficients
    fn adaptive(dim: usize) -> Self {
        let n = dim as f64;
        Self {
            rho: 1.0,
            chi: 1.0 + 2.0 / n,
            psi: 0.75 - 1.0 / (2.0 * n),
            sigma: 1.0 - 1.0 / n,
        }
    }
}

pub struct NelderMead {
    config: OptimizerConfig,
}

impl NelderMead {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn minimize<const N: usize, F>(&self, mut cost: F, x0: &SVector<f64, N>) -> Minimization<N>
    where
        F: FnMut(&SVector<f64, N>) -> f64,
    {
        let coeff = if self.config.adaptive && N > 1 {
            Coefficients::adaptive(N)
        } else {
            Coefficients::standard()
        };

        let mut evaluations = 0usize;
        let mut eval = |x: &SVector<f64, N>| {
            evaluations += 1;
            let value = cost(x);
            if value.is_finite() {
                value
            } else {
                f64::INFINITY
            }
        };

        // Initial simplex: x0 plus one vertex per axis
        let mut simplex: Vec<(SVector<f64, N>, f64)> = Vec::with_capacity(N + 1);
        simplex.push((*x0, eval(x0)));
        for k in 0..N {
            let mut y = *x0;
            if y[k] != 0.0 {
                y[k] *= 1.0 + self.config.initial_step;
            } else {
                y[k] = self.config.zero_step;
            }
            let fy = eval(&y);
            simplex.push((y, fy));
        }
        sort_simplex(&mut simplex);

        let mut iterations = 0usize;
        let mut converged = self.has_converged(&simplex);

        while !converged && iterations < self.config.max_iterations {
            // Centroid of all but the worst vertex
            let centroid = simplex[..N]
                .iter()
                .fold(SVector::<f64, N>::zeros(), |acc, (x, _)| acc + x)
                / N as f64;
            let (worst, f_worst) = simplex[N];
            let f_best = simplex[0].1;
            let f_second_worst = simplex[N - 1].1;

            let xr = centroid * (1.0 + coeff.rho) - worst * coeff.rho;
            let fxr = eval(&xr);

            let mut shrink = false;
            if fxr < f_best {
                let xe = centroid * (1.0 + coeff.rho * coeff.chi) - worst * (coeff.rho * coeff.chi);
                let fxe = eval(&xe);
                simplex[N] = if fxe < fxr { (xe, fxe) } else { (xr, fxr) };
            } else if fxr < f_second_worst {
                simplex[N] = (xr, fxr);
            } else if fxr < f_worst {
                // Outside contraction
                let xc = centroid * (1.0 + coeff.psi * coeff.rho) - worst * (coeff.psi * coeff.rho);
                let fxc = eval(&xc);
                if fxc <= fxr {
                    simplex[N] = (xc, fxc);
                } else {
                    shrink = true;
                }
            } else {
                // Inside contraction
                let xcc = centroid * (1.0 - coeff.psi) + worst * coeff.psi;
                let fxcc = eval(&xcc);
                if fxcc < f_worst {
                    simplex[N] = (xcc, fxcc);
                } else {
                    shrink = true;
                }
            }

            if shrink {
                let best = simplex[0].0;
                for vertex in simplex.iter_mut().skip(1) {
                    let x = best + (vertex.0 - best) * coeff.sigma;
                    *vertex = (x, eval(&x));
                }
            }

            sort_simplex(&mut simplex);
            iterations += 1;
            converged = self.has_converged(&simplex);
        }

        let (params, cost) = simplex[0];
        Minimization {
            params,
            cost,
            iterations,
            evaluations,
            converged,
        }
    }

    fn has_converged<const N: usize>(&self, simplex: &[(SVector<f64, N>, f64)]) -> bool {
        let (best, f_best) = &simplex[0];
        if !f_best.is_finite() {
            return false;
        }
        simplex[1..].iter().all(|(x, fx)| {
            (x - best).amax() <= self.config.xatol && (fx - f_best).abs() <= self.config.fatol
        })
    }
}

fn sort_simplex<const N: usize>(simplex: &mut [(SVector<f64, N>, f64)]) {
    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector2, Vector3};

    fn optimizer(max_iterations: usize) -> NelderMead {
        NelderMead::new(OptimizerConfig {
            max_iterations,
            ..OptimizerConfig::default()
        })
    }

    #[test]
    fn test_quadratic_bowl() {
        let target = Vector3::new(1.0, -2.0, 3.0);
        let result = optimizer(5000).minimize(|x| (x - target).norm_squared(), &Vector3::zeros());
        assert!(result.converged);
        assert!((result.params - target).amax() < 1e-6);
        assert!(result.cost < 1e-12);
    }

    #[test]
    fn test_rosenbrock() {
        let rosenbrock = |x: &Vector2<f64>| {
            let a = 1.0 - x[0];
            let b = x[1] - x[0] * x[0];
            a * a + 100.0 * b * b
        };
        let result = optimizer(5000).minimize(rosenbrock, &Vector2::new(-1.2, 1.0));
        assert!(result.converged);
        assert!((result.params - Vector2::new(1.0, 1.0)).amax() < 1e-4);
    }

    #[test]
    fn test_iteration_cap_terminates() {
        let target = Vector3::new(10.0, 10.0, 10.0);
        let result = optimizer(3).minimize(|x| (x - target).norm_squared(), &Vector3::zeros());
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
        assert!(result.cost.is_finite());
    }

    #[test]
    fn test_non_finite_region_is_avoided() {
        // Undefined for x < 0, minimum at 0.5 inside the valid region
        let f = |x: &Vector2<f64>| {
            if x[0] < 0.0 {
                f64::NAN
            } else {
                (x[0] - 0.5).powi(2) + (x[1] - 0.25).powi(2)
            }
        };
        let result = optimizer(5000).minimize(f, &Vector2::new(1.0, 1.0));
        assert!(result.cost.is_finite());
        assert!((result.params - Vector2::new(0.5, 0.25)).amax() < 1e-6);
    }

    #[test]
    fn test_already_converged_seed() {
        let mut config = OptimizerConfig::default();
        config.xatol = 1.0;
        config.fatol = 1.0;
        let optimizer = NelderMead::new(config);
        let result = optimizer.minimize(|x: &Vector2<f64>| x.norm_squared(), &Vector2::zeros());
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.evaluations, 3);
    }
}
