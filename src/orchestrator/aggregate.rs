//! Folding scored draws into distributions, bootstrap bounds and themes.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ssr::likert_metrics;

use super::types::LikertDistribution;

pub const BOOTSTRAP_SEED: u64 = 42;
pub const BOOTSTRAP_RESAMPLES: usize = 200;
pub const BOOTSTRAP_ALPHA: f64 = 0.05;
pub const THEME_COUNT: usize = 3;

const THEME_PUNCTUATION: &[char] = &['.', ',', '!', '?', '(', ')'];

/// Element-wise mean of `pmfs`, renormalized. Empty input yields zeros.
pub fn mean_pmf(pmfs: &[Vec<f64>], len: usize) -> Vec<f64> {
    let mut out = vec![0.0; len];
    if pmfs.is_empty() {
        return out;
    }
    for pmf in pmfs {
        for (slot, p) in out.iter_mut().zip(pmf) {
            *slot += p;
        }
    }
    let total: f64 = out.iter().sum();
    if total > 0.0 {
        for slot in &mut out {
            *slot /= total;
        }
    }
    out
}

/// Weighted sum of per-persona pmfs, renormalized.
pub fn weighted_pmf(parts: &[(f64, Vec<f64>)], len: usize) -> Vec<f64> {
    let mut out = vec![0.0; len];
    for (weight, pmf) in parts {
        for (slot, p) in out.iter_mut().zip(pmf) {
            *slot += weight * p;
        }
    }
    let total: f64 = out.iter().sum();
    if total > 0.0 {
        for slot in &mut out {
            *slot /= total;
        }
    }
    out
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Output distribution: metrics from the exact pmf, pmf rounded to six
/// decimals.
pub fn make_distribution(ratings: &[i32], pmf: &[f64], sample_n: usize) -> LikertDistribution {
    let (mean, top2box) = likert_metrics(pmf, ratings);
    LikertDistribution {
        ratings: ratings.to_vec(),
        pmf: pmf.iter().copied().map(round6).collect(),
        mean,
        top2box,
        sample_n,
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Percentile bootstrap interval for the mean of `values`, seeded so the
/// same input always gives the same bounds. Empty input gives NaNs.
pub fn bootstrap_ci(values: &[f64], resamples: usize, alpha: f64, seed: u64) -> (f64, f64) {
    if values.is_empty() || resamples == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let n = values.len();
    let mut means: Vec<f64> = (0..resamples)
        .map(|_| {
            let sum: f64 = (0..n).map(|_| values[rng.gen_range(0..n)]).sum();
            sum / n as f64
        })
        .collect();
    means.sort_by(|a, b| a.total_cmp(b));
    (quantile(&means, alpha / 2.0), quantile(&means, 1.0 - alpha / 2.0))
}

/// Bootstrap with the default seed, resample count and alpha.
pub fn default_bootstrap_ci(values: &[f64]) -> (f64, f64) {
    bootstrap_ci(values, BOOTSTRAP_RESAMPLES, BOOTSTRAP_ALPHA, BOOTSTRAP_SEED)
}

/// Most frequent words longer than three letters, ties by first use.
pub fn top_themes<S: AsRef<str>>(texts: &[S], k: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for text in texts {
        for raw in text.as_ref().to_lowercase().split_whitespace() {
            let token = raw.trim_matches(THEME_PUNCTUATION);
            if token.chars().count() <= 3 || !token.chars().all(char::is_alphabetic) {
                continue;
            }
            let count = counts.entry(token.to_string()).or_insert(0);
            if *count == 0 {
                order.push(token.to_string());
            }
            *count += 1;
        }
    }
    // Stable sort keeps first-seen order among equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(k);
    order
}

/// Single-line rationale text.
pub fn clean_rationale(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_deterministic_and_brackets_the_mean() {
        let values = [2.0, 3.0, 4.0, 3.5, 2.5, 3.0];
        let (lo, hi) = default_bootstrap_ci(&values);
        assert_eq!((lo, hi), default_bootstrap_ci(&values));
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(lo <= mean && mean <= hi);
        assert!(lo >= 2.0 && hi <= 4.0);
    }

    #[test]
    fn bootstrap_degenerate_inputs() {
        let (lo, hi) = default_bootstrap_ci(&[]);
        assert!(lo.is_nan() && hi.is_nan());
        assert_eq!(default_bootstrap_ci(&[3.2]), (3.2, 3.2));
    }

    #[test]
    fn themes_count_long_alphabetic_words() {
        let texts = [
            "Price is steep, but flavor (flavor!) is great.",
            "The price... honestly fine. 2024 model",
        ];
        assert_eq!(top_themes(&texts, 3), vec!["price", "flavor", "steep"]);
    }

    #[test]
    fn distribution_rounds_pmf_but_not_metrics() {
        let pmf = [0.1234567, 0.8765433];
        let dist = make_distribution(&[1, 2], &pmf, 4);
        assert_eq!(dist.pmf, vec![0.123457, 0.876543]);
        assert!((dist.mean - 1.8765433).abs() < 1e-12);
        assert_eq!(dist.sample_n, 4);
    }

    #[test]
    fn pmf_helpers_renormalize() {
        let mean = mean_pmf(&[vec![1.0, 0.0], vec![0.0, 1.0]], 2);
        assert_eq!(mean, vec![0.5, 0.5]);
        assert_eq!(mean_pmf(&[], 3), vec![0.0; 3]);
        let weighted = weighted_pmf(&[(0.25, vec![1.0, 0.0]), (0.75, vec![0.0, 1.0])], 2);
        assert_eq!(weighted, vec![0.25, 0.75]);
        assert_eq!(clean_rationale("  line one\nline two \n"), "line one line two");
    }
}
