use statrs::function::gamma::ln_gamma;

pub struct StatsHelper;

impl StatsHelper {
    /// Poisson log-probability of `observed` given mean `expected`.
    ///
    /// `observed` may be non-integer (Asimov data); returns `None` when the
    /// expectation is zero but counts were observed.
    pub fn poisson_log_pmf(observed: f64, expected: f64) -> Option<f64> {
        if expected <= 0.0 {
            return if observed == 0.0 { Some(0.0) } else { None };
        }
        let log_factorial = if observed == 0.0 {
            0.0
        } else {
            ln_gamma(observed + 1.0)
        };
        Some(observed * expected.ln() - expected - log_factorial)
    }

    /// Numerically stable ln(e^a + e^b).
    pub fn log_add_exp(a: f64, b: f64) -> f64 {
        if a == f64::NEG_INFINITY {
            return b;
        }
        if b == f64::NEG_INFINITY {
            return a;
        }
        let (hi, lo) = if a > b { (a, b) } else { (b, a) };
        hi + (lo - hi).exp().ln_1p()
    }
}
