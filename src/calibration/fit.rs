//! Accelerometer bias/scale fit against a known gravity magnitude.
//!
//! Parameters are `[bx, by, bz, sx, sy, sz]`; a corrected sample is
//! `(a - b) ⊙ s`. The cost is the mean squared deviation of corrected sample
//! norms from gravity, minimized with Nelder–Mead from `b = 0, s = 1`.

use nalgebra::Vector3;

use crate::config::OptimizerConfig;
use crate::optimize::NelderMead;
use crate::types::FitParams;

#[derive(Clone, Debug, PartialEq)]
pub struct FitOutcome {
    pub bias: Vector3<f64>,
    pub scale: Vector3<f64>,
    /// Cost at the returned parameters (seed cost when the fallback is used)
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
    /// True when the optimizer failed and the identity correction was returned
    pub fallback_used: bool,
}

impl FitOutcome {
    fn fallback(cost: f64, iterations: usize) -> Self {
        Self {
            bias: Vector3::zeros(),
            scale: Vector3::repeat(1.0),
            cost,
            iterations,
            converged: false,
            fallback_used: true,
        }
    }
}

pub fn seed() -> FitParams {
    FitParams::from_column_slice(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0])
}

/// mean((‖(a − b) ⊙ s‖ − g)²) over `accels`. Empty input costs 0.
pub fn calibration_cost<'a, I>(params: &FitParams, accels: I, gravity: f64) -> f64
where
    I: IntoIterator<Item = &'a Vector3<f64>>,
{
    let bias = params.fixed_rows::<3>(0).into_owned();
    let scale = params.fixed_rows::<3>(3).into_owned();

    let (sum, count) = accels.into_iter().fold((0.0, 0usize), |(sum, count), a| {
        let residual = (a - bias).component_mul(&scale).norm() - gravity;
        (sum + residual * residual, count + 1)
    });

    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Fit bias and scale to `accels`. A non-converged or non-finite result falls
/// back to `b = 0, s = 1` with `fallback_used` set; the caller decides how to
/// report it.
pub fn fit_accel_calibration(
    accels: &[Vector3<f64>],
    gravity: f64,
    config: &OptimizerConfig,
) -> FitOutcome {
    let x0 = seed();
    if accels.is_empty() || !gravity.is_finite() {
        return FitOutcome::fallback(f64::NAN, 0);
    }

    let optimizer = NelderMead::new(config.clone());
    let result = optimizer.minimize(|p| calibration_cost(p, accels.iter(), gravity), &x0);

    let finite = result.params.iter().all(|v| v.is_finite()) && result.cost.is_finite();
    if !(result.converged && finite) {
        let seed_cost = calibration_cost(&x0, accels.iter(), gravity);
        return FitOutcome::fallback(seed_cost, result.iterations);
    }

    FitOutcome {
        bias: result.params.fixed_rows::<3>(0).into_owned(),
        scale: result.params.fixed_rows::<3>(3).into_owned(),
        cost: result.cost,
        iterations: result.iterations,
        converged: true,
        fallback_used: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Unit directions spread over the sphere (Fibonacci lattice)
    fn sphere_directions(n: usize) -> Vec<Vector3<f64>> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).sqrt();
                let theta = golden * i as f64;
                Vector3::new(r * theta.cos(), r * theta.sin(), z)
            })
            .collect()
    }

    #[test]
    fn test_cost_zero_at_true_parameters() {
        let bias = Vector3::new(0.2, -0.1, 0.3);
        let scale = Vector3::new(1.05, 0.95, 1.02);
        let raw: Vec<Vector3<f64>> = sphere_directions(200)
            .into_iter()
            .map(|d| (d * 9.81).component_div(&scale) + bias)
            .collect();

        let mut params = FitParams::zeros();
        params.fixed_rows_mut::<3>(0).copy_from(&bias);
        params.fixed_rows_mut::<3>(3).copy_from(&scale);
        assert_relative_eq!(calibration_cost(&params, raw.iter(), 9.81), 0.0, epsilon = 1e-20);
        assert!(calibration_cost(&seed(), raw.iter(), 9.81) > 1e-3);
    }

    #[test]
    fn test_recovers_bias_and_scale() {
        let bias = Vector3::new(0.2, -0.15, 0.3);
        let scale = Vector3::new(1.05, 0.95, 1.02);
        let raw: Vec<Vector3<f64>> = sphere_directions(500)
            .into_iter()
            .map(|d| (d * 9.81).component_div(&scale) + bias)
            .collect();

        let outcome = fit_accel_calibration(&raw, 9.81, &OptimizerConfig::default());
        assert!(outcome.converged);
        assert!(!outcome.fallback_used);
        for i in 0..3 {
            assert!((outcome.bias[i] - bias[i]).abs() < 0.1 * bias[i].abs());
            assert!((outcome.scale[i] - scale[i]).abs() < 0.1 * scale[i].abs());
        }
        assert!(outcome.cost < 1e-6);
    }

    #[test]
    fn test_iteration_cap_falls_back() {
        let raw: Vec<Vector3<f64>> = sphere_directions(100)
            .into_iter()
            .map(|d| d * 9.0 + Vector3::new(0.5, 0.5, 0.5))
            .collect();
        let config = OptimizerConfig {
            max_iterations: 2,
            ..OptimizerConfig::default()
        };
        let outcome = fit_accel_calibration(&raw, 9.81, &config);
        assert!(outcome.fallback_used);
        assert!(!outcome.converged);
        assert_eq!(outcome.bias, Vector3::zeros());
        assert_eq!(outcome.scale, Vector3::repeat(1.0));
    }

    #[test]
    fn test_non_finite_samples_fall_back() {
        let raw = vec![Vector3::new(f64::NAN, 0.0, 9.81); 10];
        let outcome = fit_accel_calibration(&raw, 9.81, &OptimizerConfig::default());
        assert!(outcome.fallback_used);
        assert_eq!(outcome.scale, Vector3::repeat(1.0));
    }

    #[test]
    fn test_empty_input_falls_back() {
        let outcome = fit_accel_calibration(&[], 9.81, &OptimizerConfig::default());
        assert!(outcome.fallback_used);
        assert_eq!(outcome.iterations, 0);
    }
}
