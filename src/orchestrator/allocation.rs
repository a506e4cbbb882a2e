//! Spreading a draw budget across weighted personas.

use std::cmp::Ordering;

/// How many draws each persona gets.
///
/// Without `stratified` or `total_n` every persona gets `n`. Otherwise the
/// total (`total_n`, else `n`) is split in proportion to weight by largest
/// remainder, with every persona getting at least one draw. When the
/// minimum pushes the sum over the total, draws are taken back from the
/// smallest remainders first; if that cannot reach the total without going
/// below one, the sum stays above it.
pub fn allocate_draws(weights: &[f64], n: usize, total_n: Option<usize>, stratified: bool) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    if !stratified && total_n.is_none() {
        return vec![n; weights.len()];
    }
    apportion(weights, total_n.unwrap_or(n))
}

fn normalized(weights: &[f64]) -> Vec<f64> {
    let clamped: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 })
        .collect();
    let sum: f64 = clamped.iter().sum();
    if sum <= 0.0 {
        return vec![1.0 / weights.len() as f64; weights.len()];
    }
    clamped.into_iter().map(|w| w / sum).collect()
}

/// Largest-remainder apportionment of `total` with a floor of one per slot.
pub fn apportion(weights: &[f64], total: usize) -> Vec<usize> {
    let shares = normalized(weights);
    let raw: Vec<f64> = shares.iter().map(|w| w * total as f64).collect();
    let mut base: Vec<usize> = raw.iter().map(|r| (r.floor() as usize).max(1)).collect();
    let fractions: Vec<f64> = raw.iter().map(|r| r - r.floor()).collect();

    let assigned: usize = base.iter().sum();
    if assigned < total {
        let mut order: Vec<usize> = (0..base.len()).collect();
        order.sort_by(|&a, &b| fractions[b].partial_cmp(&fractions[a]).unwrap_or(Ordering::Equal));
        for &idx in order.iter().cycle().take(total - assigned) {
            base[idx] += 1;
        }
    } else if assigned > total {
        let mut order: Vec<usize> = (0..base.len()).collect();
        order.sort_by(|&a, &b| fractions[a].partial_cmp(&fractions[b]).unwrap_or(Ordering::Equal));
        let mut excess = assigned - total;
        let mut cursor = 0;
        while excess > 0 && cursor < order.len() {
            let idx = order[cursor];
            if base[idx] > 1 {
                base[idx] -= 1;
                excess -= 1;
            } else {
                cursor += 1;
            }
        }
    }
    base
}
