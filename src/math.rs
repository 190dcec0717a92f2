pub fn arithmetic_mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

pub fn weighted_mean(x: &[f64], weights: &[f64]) -> f64 {
    let sum = x
        .iter()
        .zip(weights.iter())
        .map(|(x, w)| x * w)
        .sum::<f64>();
    let sum_of_weights = weights.iter().sum::<f64>();
    sum / sum_of_weights
}

/// Median of a slice, `None` when empty
pub fn median(x: &[f64]) -> Option<f64> {
    if x.is_empty() {
        return None;
    }
    let mut sorted = x.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Index permutation that sorts `x` ascending
pub fn argsort(x: &[f64]) -> Vec<usize> {
    let mut order = (0..x.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    order
}
