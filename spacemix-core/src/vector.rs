//! Dense vector arithmetic used by spaces, the index and the stores.

/// Inner product of two equal-length slices.
///
/// Mismatched lengths contribute only over the shared prefix.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
#[must_use]
pub fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale `v` to unit length in place. Zero vectors stay zero.
pub fn normalize_in_place(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm < f32::EPSILON {
        v.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    v.iter_mut().for_each(|x| *x /= norm);
}

/// Unit-length copy of `v`. Zero vectors stay zero.
#[must_use]
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}

/// Cosine similarity in \[-1.0, 1.0\]; `0.0` when either side is zero or the
/// lengths differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let denom = l2_norm(a) * l2_norm(b);
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

/// Signed square root: `sign(q) * sqrt(|q|)`.
///
/// Query weights are applied through this, so a space's contribution to the
/// score is `√|q| · cos(stored, query)`: quadrupling a weight doubles that
/// space's share, and a negative weight flips its sign.
#[must_use]
pub fn signed_sqrt(q: f64) -> f64 {
    q.signum() * q.abs().sqrt()
}

/// Whether every component is (near) zero.
#[must_use]
pub fn is_zero(v: &[f32]) -> bool {
    v.iter().all(|x| x.abs() < f32::EPSILON)
}

/// `acc += scale * v`.
pub fn add_scaled(acc: &mut [f32], v: &[f32], scale: f32) {
    for (a, x) in acc.iter_mut().zip(v) {
        *a += scale * x;
    }
}
