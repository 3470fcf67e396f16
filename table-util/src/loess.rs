use rayon::prelude::*;

/// Local linear regression (loess, degree 1) with tricube weights.
///
/// Fits `y ~ x` locally at every observed `x` and returns the fitted
/// values in the original order. The neighborhood of each point is the
/// `ceil(span * n)` nearest observations along `x`; weights follow the
/// tricube kernel `(1 - (d / d_max)^3)^3`.
///
/// * `x` - predictor values, all finite
/// * `y` - response values, all finite
/// * `span` - neighborhood fraction in (0, 1]
pub fn loess_fit(x: &[f32], y: &[f32], span: f32) -> anyhow::Result<Vec<f32>> {
    let n = x.len();
    if y.len() != n {
        anyhow::bail!("loess: x and y lengths differ ({} vs {})", n, y.len());
    }
    if n < 2 {
        anyhow::bail!("loess: need at least 2 points, got {}", n);
    }
    if !(span > 0.0 && span <= 1.0) {
        anyhow::bail!("loess: span must be in (0, 1], got {}", span);
    }
    if let Some(i) = (0..n).find(|&i| !(x[i].is_finite() && y[i].is_finite())) {
        anyhow::bail!("loess: non-finite input at position {}", i);
    }

    let k = ((span * n as f32).ceil() as usize).clamp(2, n);

    // order observations along x once
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap_or(std::cmp::Ordering::Equal));
    let xs: Vec<f64> = order.iter().map(|&i| x[i] as f64).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i] as f64).collect();

    let fitted_sorted: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|p| {
            let xi = xs[p];

            // grow the window outward, taking the nearer neighbor each step
            let (mut lo, mut hi) = (p, p);
            while hi - lo + 1 < k {
                if lo == 0 {
                    hi += 1;
                } else if hi == n - 1 {
                    lo -= 1;
                } else if xi - xs[lo - 1] <= xs[hi + 1] - xi {
                    lo -= 1;
                } else {
                    hi += 1;
                }
            }

            let d_max = (xi - xs[lo]).max(xs[hi] - xi);
            if d_max <= 0.0 {
                // all neighbors at the same x: plain average
                let sum: f64 = ys[lo..=hi].iter().sum();
                return sum / k as f64;
            }

            let mut s_w = 0.0;
            let mut s_wx = 0.0;
            let mut s_wy = 0.0;
            let mut s_wxx = 0.0;
            let mut s_wxy = 0.0;
            for j in lo..=hi {
                let d = ((xs[j] - xi).abs() / d_max).min(1.0);
                let w = {
                    let t = 1.0 - d * d * d;
                    t * t * t
                };
                s_w += w;
                s_wx += w * xs[j];
                s_wy += w * ys[j];
                s_wxx += w * xs[j] * xs[j];
                s_wxy += w * xs[j] * ys[j];
            }

            let denom = s_w * s_wxx - s_wx * s_wx;
            if denom.abs() < 1e-12 * s_wxx.max(1.0) {
                s_wy / s_w
            } else {
                let slope = (s_w * s_wxy - s_wx * s_wy) / denom;
                let intercept = (s_wy - slope * s_wx) / s_w;
                intercept + slope * xi
            }
        })
        .collect();

    let mut fitted = vec![0_f32; n];
    for (p, &i) in order.iter().enumerate() {
        fitted[i] = fitted_sorted[p] as f32;
    }
    Ok(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_data_fit_exactly() {
        let x: Vec<f32> = (0..50).map(|i| i as f32 * 0.1).collect();
        let y: Vec<f32> = x.iter().map(|&v| 2.0 * v + 1.0).collect();

        let fitted = loess_fit(&x, &y, 0.3).unwrap();
        for (f, t) in fitted.iter().zip(y.iter()) {
            assert_abs_diff_eq!(*f, *t, epsilon = 1e-3);
        }
    }

    #[test]
    fn constant_response_stays_constant() {
        let x: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let y = vec![3.5_f32; 20];

        let fitted = loess_fit(&x, &y, 0.5).unwrap();
        for f in fitted {
            assert_abs_diff_eq!(f, 3.5, epsilon = 1e-4);
        }
    }

    #[test]
    fn tied_predictors_average() {
        let x = vec![1.0_f32; 5];
        let y = vec![0.0_f32, 1.0, 2.0, 3.0, 4.0];
        let fitted = loess_fit(&x, &y, 1.0).unwrap();
        for f in fitted {
            assert_abs_diff_eq!(f, 2.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn follows_smooth_trend() {
        // quadratic trend: local linear fit should track it closely
        let x: Vec<f32> = (0..100).map(|i| i as f32 * 0.05).collect();
        let y: Vec<f32> = x.iter().map(|&v| v * v).collect();

        let fitted = loess_fit(&x, &y, 0.2).unwrap();
        for (f, t) in fitted.iter().zip(y.iter()) {
            assert!((f - t).abs() < 0.2, "fitted {} too far from {}", f, t);
        }
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(loess_fit(&[1.0], &[1.0], 0.3).is_err());
        assert!(loess_fit(&[1.0, 2.0], &[1.0], 0.3).is_err());
        assert!(loess_fit(&[1.0, 2.0], &[1.0, 2.0], 0.0).is_err());
        assert!(loess_fit(&[1.0, 2.0], &[1.0, 2.0], 1.5).is_err());
        assert!(loess_fit(&[1.0, f32::NAN], &[1.0, 2.0], 0.5).is_err());
    }
}
