//! Small robust-statistics helpers shared by the calibration and clustering code.

use std::cmp::Ordering;

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

/// Median of the finite values; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    let v = sorted_finite(values);
    let n = v.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(v[n / 2])
    } else {
        Some(0.5 * (v[n / 2 - 1] + v[n / 2]))
    }
}

/// Population standard deviation (divisor `n`) of the non-NaN values.
pub fn population_std(values: &[f64]) -> Option<f64> {
    let v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return None;
    }
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    Some(var.sqrt())
}

/// Fixed-width magnitude histogram used for the `max_use` and limiting-magnitude estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnitudeHistogram {
    pub lo: f64,
    pub hi: f64,
    pub bin_width: f64,
}

impl Default for MagnitudeHistogram {
    fn default() -> Self {
        Self {
            lo: 0.0,
            hi: 20.0,
            bin_width: 0.25,
        }
    }
}

impl MagnitudeHistogram {
    pub fn n_bins(&self) -> usize {
        let n = ((self.hi - self.lo) / self.bin_width).round();
        if n.is_finite() && n > 0.0 {
            n as usize
        } else {
            0
        }
    }

    /// Bin counts. Values outside `[lo, hi]` are ignored; the last bin is closed.
    pub fn counts(&self, values: &[f64]) -> Vec<usize> {
        let n = self.n_bins();
        let mut counts = vec![0usize; n];
        if n == 0 {
            return counts;
        }
        for &v in values {
            if !v.is_finite() || v < self.lo || v > self.hi {
                continue;
            }
            let idx = (((v - self.lo) / self.bin_width).floor() as usize).min(n - 1);
            counts[idx] += 1;
        }
        counts
    }

    /// Center of the most populated bin. The first bin wins ties; `None` if no
    /// value falls inside the histogram range.
    pub fn mode_center(&self, values: &[f64]) -> Option<f64> {
        let counts = self.counts(values);
        let mut best: Option<(usize, usize)> = None;
        for (idx, &c) in counts.iter().enumerate() {
            if c == 0 {
                continue;
            }
            match best {
                Some((_, best_count)) if best_count >= c => {}
                _ => best = Some((idx, c)),
            }
        }
        best.map(|(idx, _)| self.lo + (idx as f64 + 0.5) * self.bin_width)
    }
}

/// Median-filter window length for a star of magnitude `mag`: `round(round(mag²/100)·2 + 1)`,
/// rounding half to even. Always odd.
pub fn adaptive_window(mag: f64) -> usize {
    let k = ((mag * mag / 100.0).round_ties_even() * 2.0 + 1.0).round_ties_even();
    if k.is_finite() && k >= 1.0 {
        k as usize
    } else {
        1
    }
}

/// Median of the `window`-wide neighborhood of `values[center]`, zero-padded past the ends.
fn window_median(values: &[f64], center: usize, window: usize) -> f64 {
    let half = window / 2;
    let mut buf = Vec::with_capacity(window);
    for offset in 0..window {
        let pos = center as isize + offset as isize - half as isize;
        let v = if pos < 0 || pos as usize >= values.len() {
            0.0
        } else {
            values[pos as usize]
        };
        buf.push(v);
    }
    buf.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    buf[buf.len() / 2]
}

/// Magnitude-adaptive running median of `offsets`, sorted by `mags`.
///
/// Each point uses the window from [`adaptive_window`] for its own magnitude.
/// Smoothing proceeds in place from the bright end: the window around point
/// `i` already sees the smoothed values of points before it.
pub fn adaptive_median_filter(mags: &[f64], offsets: &[f64]) -> Vec<f64> {
    let mut smoothed = offsets.to_vec();
    for i in 0..smoothed.len() {
        let window = adaptive_window(mags[i]);
        smoothed[i] = window_median(&smoothed, i, window);
    }
    smoothed
}
