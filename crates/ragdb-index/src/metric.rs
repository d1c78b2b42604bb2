//! Similarity scoring. Every metric is mapped so that a higher score is a closer match:
//!
//! | metric      | stored rows        | score                     |
//! |-------------|--------------------|---------------------------|
//! | `cosine`    | L2-normalized      | `q̂ · r̂` in `[-1, 1]`      |
//! | `dot`       | as given           | `q · r`                   |
//! | `euclidean` | as given           | `1 / (1 + ‖q − r‖)` in `(0, 1]` |

use ragdb_core::types::Metric;

/// Scale `v` to unit length in place. Zero vectors stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() { *x /= norm; }
    }
}

/// Copy `v` into the representation a snapshot stores (and queries with) for `metric`.
pub fn prepare(metric: Metric, v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    if metric == Metric::Cosine { l2_normalize(&mut out); }
    out
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

/// Score a prepared query against a prepared row.
#[inline]
pub fn score(metric: Metric, query: &[f32], row: &[f32]) -> f32 {
    match metric {
        Metric::Cosine | Metric::Dot => dot(query, row),
        Metric::Euclidean => 1.0 / (1.0 + l2_distance(query, row)),
    }
}
