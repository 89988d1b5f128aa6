//! Ordinary least squares fit of value against elapsed time.

use crate::stats::student_t_two_sided_p;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// `None` when the values have no variance.
    pub r_squared: Option<f64>,
    /// Standard error of the slope.
    pub slope_std_error: f64,
    /// Two-sided p-value for `slope != 0`.
    pub p_value: f64,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fits `y = intercept + slope * x`. Needs at least three points and some
/// spread in `x`, otherwise there are no residual degrees of freedom to judge
/// the slope with.
pub fn fit(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let n = xs.len();
    if n < 3 || n != ys.len() {
        return None;
    }

    let count = n as f64;
    let mean_x = xs.iter().sum::<f64>() / count;
    let mean_y = ys.iter().sum::<f64>() / count;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx <= 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let sse: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let residual = y - (intercept + slope * x);
            residual * residual
        })
        .sum();

    let degrees_of_freedom = count - 2.0;
    let slope_std_error = (sse / degrees_of_freedom / sxx).sqrt();
    let p_value = if slope_std_error > 0.0 {
        student_t_two_sided_p(slope / slope_std_error, degrees_of_freedom)
    } else if slope == 0.0 {
        1.0
    } else {
        0.0
    };

    let r_squared = (syy > 0.0).then(|| (1.0 - sse / syy).clamp(0.0, 1.0));

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
        slope_std_error,
        p_value,
    })
}
