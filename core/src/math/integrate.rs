/// Trapezoid-rule helpers on tabulated functions.
pub struct IntegrationHelper;

impl IntegrationHelper {
    pub fn trapezoid(xs: &[f64], ys: &[f64]) -> f64 {
        xs.windows(2)
            .zip(ys.windows(2))
            .map(|(x, y)| 0.5 * (x[1] - x[0]) * (y[0] + y[1]))
            .sum()
    }

    /// `tail[i]` = integral of `ys` from `xs[i]` to the last abscissa.
    pub fn cumulative_tail(xs: &[f64], ys: &[f64]) -> Vec<f64> {
        let mut tail = vec![0.0; xs.len()];
        for i in (0..xs.len().saturating_sub(1)).rev() {
            tail[i] = tail[i + 1] + 0.5 * (xs[i + 1] - xs[i]) * (ys[i] + ys[i + 1]);
        }
        tail
    }

    /// Linear interpolation on an increasing grid; zero outside it.
    pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
        let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
            return 0.0;
        };
        if x < first || x > last {
            return 0.0;
        }
        let upper = xs.partition_point(|&v| v < x).min(xs.len() - 1);
        if upper == 0 {
            return ys[0];
        }
        let lower = upper - 1;
        let span = xs[upper] - xs[lower];
        if span <= 0.0 {
            return ys[upper];
        }
        let t = (x - xs[lower]) / span;
        ys[lower] + t * (ys[upper] - ys[lower])
    }
}
