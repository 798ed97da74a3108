use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::*;

/// Added to component counts so that empty components keep a positive weight.
const COUNT_FLOOR: f64 = 10. * f64::EPSILON;
/// Lloyd iterations used to initialize EM.
const KMEANS_ITER: usize = 20;
/// Tolerance on the sum of the weights of a dictionary.
const WEIGHT_SUM_TOL: f64 = 1e-6;

/// Per-descriptor posteriors, inline for dictionaries up to 16 components.
pub(crate) type Posteriors = SmallVec<[f64; 16]>;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
#[serde(try_from = "GmmArrays")]
/// Gaussian mixture with diagonal covariances over reduced descriptors.
///
/// Means, variances and weights are positionally aligned: row `k` of
/// `means` and `variances` and entry `k` of `weights` describe component `k`.
/// A deserialized dictionary goes through the same checks as [`Gmm::new`].
pub struct Gmm {
    means: Array2<f64>,
    variances: Array2<f64>,
    weights: Array1<f64>,
}

/// Serialized form of a [`Gmm`], before validation.
#[derive(Deserialize)]
struct GmmArrays {
    means: Array2<f64>,
    variances: Array2<f64>,
    weights: Array1<f64>,
}

impl TryFrom<GmmArrays> for Gmm {
    type Error = FvErr;

    fn try_from(a: GmmArrays) -> FvResult<Self> {
        Gmm::new(a.means, a.variances, a.weights)
    }
}

/// Zeroth, first and second order statistics of descriptors under a [`Gmm`].
pub(crate) struct SuffStats {
    /// `K`, soft count per component.
    pub s0: Array1<f64>,
    /// `K x D`, posterior weighted sum of descriptors.
    pub s1: Array2<f64>,
    /// `K x D`, posterior weighted sum of squared descriptors.
    pub s2: Array2<f64>,
    /// Total log-likelihood of the descriptors.
    pub log_likelihood: f64,
    /// Number of descriptors `T`.
    pub count: usize,
}

impl SuffStats {
    fn zeros(k: usize, d: usize) -> Self {
        Self {
            s0: Array1::zeros(k),
            s1: Array2::zeros((k, d)),
            s2: Array2::zeros((k, d)),
            log_likelihood: 0.,
            count: 0,
        }
    }

    fn add(&mut self, k: usize, gamma: f64, x: ArrayView1<'_, f64>) {
        self.s0[k] += gamma;
        self.s1
            .row_mut(k)
            .zip_mut_with(&x, |s, &v| *s += gamma * v);
        self.s2
            .row_mut(k)
            .zip_mut_with(&x, |s, &v| *s += gamma * v * v);
    }
}

/// Dictionary API
impl Gmm {
    /// Build a dictionary from its three parallel arrays.
    ///
    /// Weights must be positive and sum to one, variances strictly positive.
    pub fn new(means: Array2<f64>, variances: Array2<f64>, weights: Array1<f64>) -> FvResult<Self> {
        if means.dim() != variances.dim() || means.nrows() != weights.len() {
            return Err(FvErr::InvalidParameter(format!(
                "misaligned dictionary: means {:?}, variances {:?}, weights {}",
                means.dim(),
                variances.dim(),
                weights.len()
            )));
        }
        if weights.is_empty() {
            return Err(FvErr::InvalidParameter("empty dictionary".into()));
        }
        if weights.iter().any(|&w| !(w > 0.) || !w.is_finite()) {
            return Err(FvErr::InvalidParameter(
                "component weights must be positive".into(),
            ));
        }
        if (weights.sum() - 1.).abs() > WEIGHT_SUM_TOL {
            return Err(FvErr::InvalidParameter(format!(
                "component weights sum to {}",
                weights.sum()
            )));
        }
        let gmm = Self {
            means,
            variances,
            weights,
        };
        gmm.check_variances()?;
        Ok(gmm)
    }

    /// Fit `k` components to reduced descriptors with Expectation-Maximization.
    ///
    /// The caller must provide at least `k` distinct descriptors and no
    /// constant dimension; anything else is rejected as degenerate.
    pub fn fit(x: ArrayView2<'_, f64>, k: usize, params: &GmmParams) -> FvResult<Self> {
        let (n, d) = x.dim();
        if k == 0 || d == 0 {
            return Err(FvErr::InvalidParameter(format!(
                "cannot fit {} components in {} dimensions",
                k, d
            )));
        }
        let distinct = count_distinct_rows(x, k);
        if distinct < k {
            return Err(FvErr::DegenerateTraining(format!(
                "{} distinct descriptors for {} components",
                distinct, k
            )));
        }
        let var = x.var_axis(Axis(0), 0.);
        if let Some(dim) = var.iter().position(|&v| !(v > 0.)) {
            return Err(FvErr::DegenerateTraining(format!(
                "dimension {} has zero variance",
                dim
            )));
        }

        info!("Training GMM of size {} on {} descriptors", k, n);
        let mut rng = StdRng::seed_from_u64(params.seed);
        let centers = kmeans_plus_plus(x, k, &mut rng);
        let mut gmm = Self::from_stats(&kmeans_stats(x, centers), params.reg_covar)?;

        let mut prev = f64::NEG_INFINITY;
        let mut converged = false;
        for iter in 0..params.max_iter {
            let stats = gmm.accumulate(x)?;
            let mean_ll = stats.log_likelihood / n as f64;
            gmm = Self::from_stats(&stats, params.reg_covar)?;
            debug!("EM iteration {}: mean log-likelihood {:.6}", iter, mean_ll);
            if (mean_ll - prev).abs() < params.tol {
                converged = true;
                break;
            }
            prev = mean_ll;
        }
        if !converged {
            warn!(
                "EM did not converge in {} iterations (tol {})",
                params.max_iter, params.tol
            );
        }
        Ok(gmm)
    }

    /// Drop components whose weight is at or under `threshold`.
    ///
    /// Remaining weights are renormalized to sum to one.
    pub fn filter_weights(self, threshold: f64) -> FvResult<Self> {
        let keep: Vec<usize> = (0..self.n_components())
            .filter(|&k| self.weights[k] > threshold)
            .collect();
        if keep.is_empty() {
            return Err(FvErr::DegenerateTraining(format!(
                "no component weighs more than {}",
                threshold
            )));
        }
        if keep.len() == self.n_components() {
            return Ok(self);
        }
        info!(
            "Dropping {} of {} components with weight <= {}",
            self.n_components() - keep.len(),
            self.n_components(),
            threshold
        );
        let weights = self.weights.select(Axis(0), &keep);
        let total = weights.sum();
        Ok(Self {
            means: self.means.select(Axis(0), &keep),
            variances: self.variances.select(Axis(0), &keep),
            weights: weights / total,
        })
    }

    /// Number of components `K`.
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Dimension `D` of the modeled descriptors.
    pub fn dim(&self) -> usize {
        self.means.ncols()
    }

    /// Length `K * (1 + 2D)` of the Fisher Vectors built on this dictionary.
    pub fn fv_len(&self) -> usize {
        self.n_components() * (1 + 2 * self.dim())
    }

    pub fn means(&self) -> ArrayView2<'_, f64> {
        self.means.view()
    }

    /// Diagonal of each component's covariance.
    pub fn variances(&self) -> ArrayView2<'_, f64> {
        self.variances.view()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl Gmm {
    /// Every variance must be strictly positive for the densities to exist.
    pub(crate) fn check_variances(&self) -> FvResult<()> {
        for (component, row) in self.variances.outer_iter().enumerate() {
            if row.iter().any(|&v| !(v > 0.) || !v.is_finite()) {
                return Err(FvErr::SingularCovariance { component });
            }
        }
        Ok(())
    }

    /// `ln w_k - 0.5 * sum_d ln(2 pi var_kd)` for every component.
    fn log_norms(&self) -> Array1<f64> {
        let ln_2pi = (2. * std::f64::consts::PI).ln();
        self.variances
            .outer_iter()
            .zip(self.weights.iter())
            .map(|(var, w)| w.ln() - 0.5 * var.iter().map(|v| ln_2pi + v.ln()).sum::<f64>())
            .collect()
    }

    /// Posterior probability of each component for one descriptor, and the
    /// log-likelihood of that descriptor.
    fn posteriors(&self, x: ArrayView1<'_, f64>, log_norms: &Array1<f64>) -> (Posteriors, f64) {
        let mut post: Posteriors = self
            .means
            .outer_iter()
            .zip(self.variances.outer_iter())
            .zip(log_norms.iter())
            .map(|((mu, var), c)| {
                let mahalanobis = x
                    .iter()
                    .zip(mu.iter())
                    .zip(var.iter())
                    .fold(0., |a, ((x, m), v)| a + (x - m) * (x - m) / v);
                c - 0.5 * mahalanobis
            })
            .collect();
        let max = post.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + post.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
        for p in post.iter_mut() {
            *p = (*p - lse).exp();
        }
        (post, lse)
    }

    /// Accumulate the sufficient statistics of `x` (one descriptor per row).
    pub(crate) fn accumulate(&self, x: ArrayView2<'_, f64>) -> FvResult<SuffStats> {
        if x.ncols() != self.dim() {
            return Err(FvErr::DimensionMismatch {
                expected: self.dim(),
                found: x.ncols(),
            });
        }
        self.check_variances()?;
        let log_norms = self.log_norms();
        let mut stats = SuffStats::zeros(self.n_components(), self.dim());
        for row in x.outer_iter() {
            let (post, ll) = self.posteriors(row, &log_norms);
            for (k, &gamma) in post.iter().enumerate() {
                stats.add(k, gamma, row);
            }
            stats.log_likelihood += ll;
            stats.count += 1;
        }
        Ok(stats)
    }

    /// M-step: new parameters from accumulated statistics.
    fn from_stats(stats: &SuffStats, reg_covar: f64) -> FvResult<Self> {
        let nk = &stats.s0 + COUNT_FLOOR;
        let nk_col = nk.view().insert_axis(Axis(1));
        let means = &stats.s1 / &nk_col;
        let variances = &stats.s2 / &nk_col - &means * &means + reg_covar;
        let weights = &nk / nk.sum();
        let gmm = Self {
            means,
            variances,
            weights,
        };
        gmm.check_variances()?;
        Ok(gmm)
    }
}

/// Count distinct rows, stopping as soon as `limit` are found.
fn count_distinct_rows(x: ArrayView2<'_, f64>, limit: usize) -> usize {
    let mut seen: Vec<ArrayView1<'_, f64>> = Vec::with_capacity(limit);
    for row in x.outer_iter() {
        if !seen.iter().any(|s| *s == row) {
            seen.push(row);
            if seen.len() >= limit {
                break;
            }
        }
    }
    seen.len()
}

#[inline]
fn sq_dist(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).fold(0., |s, (x, y)| s + (x - y) * (x - y))
}

/// k-means++ seeding: each new center is drawn with probability
/// proportional to its squared distance to the closest chosen center.
fn kmeans_plus_plus(x: ArrayView2<'_, f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = x.nrows();
    let mut centers = Array2::zeros((k, x.ncols()));
    centers.row_mut(0).assign(&x.row(rng.gen_range(0..n)));
    let mut closest: Vec<f64> = x.outer_iter().map(|r| sq_dist(r, centers.row(0))).collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let mut target = rng.gen::<f64>() * total;
        let mut pick = n - 1;
        for (i, &d) in closest.iter().enumerate() {
            if d > 0. && target < d {
                pick = i;
                break;
            }
            target -= d;
        }
        // Rounding can run off the end; fall back to the farthest point
        if closest[pick] == 0. {
            pick = closest
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
        }
        centers.row_mut(c).assign(&x.row(pick));
        for (i, r) in x.outer_iter().enumerate() {
            closest[i] = closest[i].min(sq_dist(r, centers.row(c)));
        }
    }
    centers
}

/// Refine `centers` with Lloyd iterations and return the statistics of the
/// resulting hard assignment.
fn kmeans_stats(x: ArrayView2<'_, f64>, mut centers: Array2<f64>) -> SuffStats {
    let (k, d) = centers.dim();
    let assign = |centers: &Array2<f64>| -> Vec<usize> {
        x.outer_iter()
            .map(|r| {
                let mut best = (0, f64::INFINITY);
                for (j, c) in centers.outer_iter().enumerate() {
                    let dist = sq_dist(r, c);
                    if dist < best.1 {
                        best = (j, dist);
                    }
                }
                best.0
            })
            .collect()
    };

    let mut groups = assign(&centers);
    for _ in 0..KMEANS_ITER {
        let mut sums = Array2::<f64>::zeros((k, d));
        let mut counts = vec![0usize; k];
        for (r, &g) in x.outer_iter().zip(&groups) {
            sums.row_mut(g).zip_mut_with(&r, |s, &v| *s += v);
            counts[g] += 1;
        }
        for (j, &c) in counts.iter().enumerate() {
            // Empty clusters keep their previous center
            if c > 0 {
                let mean = &sums.row(j) / c as f64;
                centers.row_mut(j).assign(&mean);
            }
        }
        let new_groups = assign(&centers);
        if new_groups == groups {
            break; // converged
        }
        groups = new_groups;
    }

    let mut stats = SuffStats::zeros(k, d);
    for (r, &g) in x.outer_iter().zip(&groups) {
        stats.add(g, 1., r);
        stats.count += 1;
    }
    stats
}

impl fmt::Debug for Gmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gmm")
            .field("Components", &self.n_components())
            .field("Dimension", &self.dim())
            .field("Min Weight", &self.weights.iter().copied().fold(f64::INFINITY, f64::min))
            .field("Max Weight", &self.weights.iter().copied().fold(0., f64::max))
            .field("Fisher Vector Length", &self.fv_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::distributions::Uniform;

    /// Two tight blobs around (-5, -5) and (5, 5).
    fn two_blobs(n: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(3);
        let noise = Uniform::new(-1., 1.);
        Array2::from_shape_fn((n, 2), |(i, _)| {
            let center = if i % 2 == 0 { -5. } else { 5. };
            center + rng.sample(noise)
        })
    }

    #[test]
    fn separates_two_blobs() {
        let x = two_blobs(400);
        let gmm = Gmm::fit(x.view(), 2, &GmmParams::default()).unwrap();
        assert_eq!(gmm.n_components(), 2);
        for &w in gmm.weights() {
            assert!((w - 0.5).abs() < 0.05);
        }
        let mut firsts: Vec<f64> = gmm.means().column(0).to_vec();
        firsts.sort_by(f64::total_cmp);
        assert!((firsts[0] + 5.).abs() < 0.3);
        assert!((firsts[1] - 5.).abs() < 0.3);
        // Uniform(-1, 1) has variance 1/3
        for &v in gmm.variances() {
            assert!((v - 1. / 3.).abs() < 0.1);
        }
    }

    #[test]
    fn weights_form_a_distribution() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array2::from_shape_fn((300, 4), |_| rng.gen_range(-3.0f64..3.0));
        let gmm = Gmm::fit(x.view(), 5, &GmmParams::default()).unwrap();
        assert!(gmm.weights().iter().all(|&w| w >= 0.));
        assert!((gmm.weights().sum() - 1.).abs() < 1e-9);
        assert!(gmm.check_variances().is_ok());
    }

    #[test]
    fn same_seed_same_dictionary() {
        let x = two_blobs(200);
        let params = GmmParams::default();
        let a = Gmm::fit(x.view(), 3, &params).unwrap();
        let b = Gmm::fit(x.view(), 3, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_few_distinct_points() {
        let x = array![[1., 2.], [1., 2.], [3., 4.], [3., 4.]];
        assert!(matches!(
            Gmm::fit(x.view(), 3, &GmmParams::default()),
            Err(FvErr::DegenerateTraining(_))
        ));
    }

    #[test]
    fn constant_dimension_is_degenerate() {
        let x = array![[1., 0.], [2., 0.], [3., 0.], [4., 0.]];
        assert!(matches!(
            Gmm::fit(x.view(), 2, &GmmParams::default()),
            Err(FvErr::DegenerateTraining(_))
        ));
    }

    #[test]
    fn filter_drops_light_components() {
        let gmm = Gmm::new(
            array![[0., 0.], [1., 1.], [2., 2.]],
            array![[1., 1.], [1., 1.], [1., 1.]],
            array![0.5, 0.45, 0.05],
        )
        .unwrap();
        let kept = gmm.clone().filter_weights(0.).unwrap();
        assert_eq!(kept, gmm);

        let filtered = gmm.filter_weights(0.1).unwrap();
        assert_eq!(filtered.n_components(), 2);
        assert!((filtered.weights().sum() - 1.).abs() < 1e-12);
        assert_eq!(filtered.means().row(1), array![1., 1.]);
        assert!(filtered.clone().filter_weights(0.9).is_err());
    }

    #[test]
    fn new_validates_arrays() {
        let means = array![[0., 0.], [1., 1.]];
        assert!(matches!(
            Gmm::new(means.clone(), array![[1., 1.], [0., 1.]], array![0.5, 0.5]),
            Err(FvErr::SingularCovariance { component: 1 })
        ));
        assert!(Gmm::new(means.clone(), array![[1., 1.], [1., 1.]], array![0.5, 0.2]).is_err());
        assert!(Gmm::new(means, array![[1., 1.]], array![0.5, 0.5]).is_err());
    }

    #[test]
    fn deserialization_validates_arrays() {
        let gmm = Gmm::new(
            array![[0., 0.], [4., 4.]],
            array![[1., 1.], [2., 2.]],
            array![0.3, 0.7],
        )
        .unwrap();
        let value = serde_json::to_value(&gmm).unwrap();
        assert_eq!(serde_json::from_value::<Gmm>(value.clone()).unwrap(), gmm);

        let mut misaligned = value.clone();
        misaligned["variances"] = serde_json::to_value(array![[1., 1.]]).unwrap();
        assert!(serde_json::from_value::<Gmm>(misaligned).is_err());

        let mut singular = value;
        singular["variances"] = serde_json::to_value(array![[1., 1.], [0., 2.]]).unwrap();
        assert!(serde_json::from_value::<Gmm>(singular).is_err());
    }

    #[test]
    fn posteriors_sum_to_one() {
        let gmm = Gmm::new(
            array![[0., 0.], [4., 4.]],
            array![[1., 1.], [2., 2.]],
            array![0.3, 0.7],
        )
        .unwrap();
        let norms = gmm.log_norms();
        for x in [array![0., 0.], array![2., 2.], array![100., -100.]] {
            let (post, ll) = gmm.posteriors(x.view(), &norms);
            assert!((post.iter().sum::<f64>() - 1.).abs() < 1e-12);
            assert!(ll.is_finite());
        }
        let (post, _) = gmm.posteriors(array![0., 0.].view(), &norms);
        assert!(post[0] > post[1]);
    }
}
