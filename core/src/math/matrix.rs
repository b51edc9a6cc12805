use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

pub struct MatrixHelper;

impl MatrixHelper {
    /// Apply a kernel matrix to a vector.
    pub fn apply(kernel: ArrayView2<f64>, values: ArrayView1<f64>) -> Array1<f64> {
        kernel.dot(&values)
    }

    /// Weighted mean and covariance of row-wise samples.
    ///
    /// Weights need not be normalized. An empty sample set yields zeros.
    pub fn weighted_mean_cov(samples: &[Vec<f64>], weights: &[f64]) -> (Array1<f64>, Array2<f64>) {
        let dim = samples.first().map(|s| s.len()).unwrap_or(0);
        let mut mean = Array1::<f64>::zeros(dim);
        let mut cov = Array2::<f64>::zeros((dim, dim));
        let total: f64 = weights.iter().sum();
        if samples.is_empty() || total <= 0.0 {
            return (mean, cov);
        }

        for (sample, &w) in samples.iter().zip(weights) {
            for (m, &x) in mean.iter_mut().zip(sample) {
                *m += w * x;
            }
        }
        mean /= total;

        for (sample, &w) in samples.iter().zip(weights) {
            for i in 0..dim {
                let di = sample[i] - mean[i];
                for j in 0..dim {
                    cov[[i, j]] += w * di * (sample[j] - mean[j]);
                }
            }
        }
        cov /= total;
        (mean, cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn weighted_mean_cov_of_two_points() {
        let samples = vec![vec![0.0, 1.0], vec![2.0, 3.0]];
        let (mean, cov) = MatrixHelper::weighted_mean_cov(&samples, &[1.0, 1.0]);
        assert_relative_eq!(mean[0], 1.0);
        assert_relative_eq!(mean[1], 2.0);
        assert_relative_eq!(cov[[0, 0]], 1.0);
        assert_relative_eq!(cov[[0, 1]], 1.0);
    }

    #[test]
    fn empty_samples_give_zero_moments() {
        let (mean, cov) = MatrixHelper::weighted_mean_cov(&[], &[]);
        assert!(mean.is_empty());
        assert!(cov.is_empty());
    }
}
