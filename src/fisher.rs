//! Fisher Vector encoding.
//!
//! An image's reduced descriptors `x_1..x_T` are summarized by the gradient
//! of their log-likelihood under the dictionary with respect to the mixture
//! weights, means and variances. With `S0`, `S1`, `S2` the zeroth, first and
//! second order posterior statistics of component `k`:
//!
//! ```text
//! G_w  = (S0 - T w) / sqrt(w)
//! G_mu = (S1 - mu S0) / sqrt(w var)
//! G_var = (S2 - 2 mu S1 + (mu^2 - var) S0) / (sqrt(2 w) var)
//! ```
//!
//! The three blocks are concatenated (weights, means, variances, each
//! component-major), then power and L2 normalized. The usual `1 / T` factor
//! is omitted: it scales every entry alike and the normalization removes it.

use ndarray::ArrayView2;

use crate::gmm::SuffStats;
use crate::*;

/// Encode raw descriptors: reduce them with `pca`, then encode against `gmm`.
///
/// `pca` must be the reducer the dictionary was trained with.
pub fn encode(descriptors: ArrayView2<'_, f32>, pca: &Pca, gmm: &Gmm) -> FvResult<FisherVector> {
    if descriptors.nrows() == 0 {
        return Err(FvErr::NoDescriptors);
    }
    let reduced = pca.transform(descriptors)?;
    encode_reduced(reduced.view(), gmm)
}

/// Encode descriptors already projected into the dictionary's space.
pub fn encode_reduced(x: ArrayView2<'_, f64>, gmm: &Gmm) -> FvResult<FisherVector> {
    if x.nrows() == 0 {
        return Err(FvErr::NoDescriptors);
    }
    let stats = gmm.accumulate(x)?;
    let mut fv = gradients(&stats, gmm);
    power_normalize(&mut fv);
    l2_normalize(&mut fv)?;
    Ok(fv.into_iter().map(|v| v as f32).collect())
}

/// Unnormalized gradient blocks, in Fisher Vector order.
fn gradients(stats: &SuffStats, gmm: &Gmm) -> Vec<f64> {
    let (mu, var, w) = (gmm.means(), gmm.variances(), gmm.weights());
    let t = stats.count as f64;
    let mut fv = Vec::with_capacity(gmm.fv_len());

    for k in 0..gmm.n_components() {
        fv.push((stats.s0[k] - t * w[k]) / w[k].sqrt());
    }
    for k in 0..gmm.n_components() {
        for d in 0..gmm.dim() {
            let g = (stats.s1[[k, d]] - mu[[k, d]] * stats.s0[k]) / (w[k] * var[[k, d]]).sqrt();
            fv.push(g);
        }
    }
    for k in 0..gmm.n_components() {
        let norm = (2. * w[k]).sqrt();
        for d in 0..gmm.dim() {
            let (m, v) = (mu[[k, d]], var[[k, d]]);
            let g = (stats.s2[[k, d]] - 2. * m * stats.s1[[k, d]] + (m * m - v) * stats.s0[k])
                / (norm * v);
            fv.push(g);
        }
    }
    fv
}

/// Signed square root of every entry.
pub fn power_normalize(v: &mut [f64]) {
    for x in v.iter_mut() {
        *x = x.signum() * x.abs().sqrt();
    }
}

/// Scale to unit Euclidean norm. A zero vector cannot be normalized.
pub fn l2_normalize(v: &mut [f64]) -> FvResult<()> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0. || !norm.is_finite() {
        return Err(FvErr::ZeroVector);
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(())
}
