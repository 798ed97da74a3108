use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::*;

/// Maximum number of cyclic Jacobi sweeps.
const MAX_SWEEPS: usize = 64;
/// Off-diagonal Frobenius norm, relative to the full norm, at which the sweeps stop.
const JACOBI_EPS: f64 = 1e-12;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
/// Frozen linear projection from descriptor space to `D` dimensions.
///
/// The same instance must be used to reduce training descriptors and every
/// descriptor encoded afterwards: vectors produced through two different fits
/// are not comparable.
pub struct Pca {
    mean: Array1<f64>,
    /// `D x d`, one principal axis per row, by decreasing variance.
    components: Array2<f64>,
    explained_variance: Array1<f64>,
}

impl Pca {
    /// Fit the `n_components` principal axes of a descriptor matrix.
    pub fn fit(descriptors: ArrayView2<'_, f32>, n_components: usize) -> FvResult<Self> {
        let (n, d) = descriptors.dim();
        if n < 2 {
            return Err(FvErr::InvalidParameter(format!(
                "PCA needs at least 2 descriptors, got {}",
                n
            )));
        }
        if n_components == 0 || n_components > d {
            return Err(FvErr::InvalidParameter(format!(
                "cannot reduce {} dimensions to {}",
                d, n_components
            )));
        }

        // Centered in place, the only f64 copy of the descriptors
        let mut centered = descriptors.mapv(f64::from);
        let mean = centered
            .mean_axis(Axis(0))
            .ok_or_else(|| FvErr::DegenerateTraining("empty descriptor matrix".into()))?;
        centered -= &mean;
        let cov = centered.t().dot(&centered) / (n - 1) as f64;
        drop(centered);

        let (eigvals, eigvecs) = jacobi_eigen(cov);
        let mut order: Vec<usize> = (0..d).collect();
        // Stable: equal eigenvalues keep axis order
        order.sort_by(|&a, &b| eigvals[b].total_cmp(&eigvals[a]));

        let mut components = Array2::zeros((n_components, d));
        let mut explained_variance = Array1::zeros(n_components);
        for (row, &j) in order.iter().take(n_components).enumerate() {
            let mut axis = eigvecs.column(j).to_owned();
            // Fix the sign so that repeated fits give the same projection
            let pivot = axis
                .iter()
                .fold(0f64, |best, &v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0. {
                axis.mapv_inplace(|v| -v);
            }
            components.row_mut(row).assign(&axis);
            explained_variance[row] = eigvals[j].max(0.);
        }

        log::info!(
            "PCA fitted on {} descriptors: {} -> {} dimensions",
            n,
            d,
            n_components
        );
        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    /// Project descriptors into the reduced space.
    pub fn transform(&self, descriptors: ArrayView2<'_, f32>) -> FvResult<Array2<f64>> {
        if descriptors.ncols() != self.input_dim() {
            return Err(FvErr::DimensionMismatch {
                expected: self.input_dim(),
                found: descriptors.ncols(),
            });
        }
        let centered = descriptors.mapv(f64::from) - &self.mean;
        Ok(centered.dot(&self.components.t()))
    }

    /// Dimension of the descriptors seen at fit time.
    pub fn input_dim(&self) -> usize {
        self.components.ncols()
    }

    /// Reduced dimension `D`.
    pub fn output_dim(&self) -> usize {
        self.components.nrows()
    }

    /// Variance of the training data along each kept axis.
    pub fn explained_variance(&self) -> ArrayView1<'_, f64> {
        self.explained_variance.view()
    }
}

/// Eigen decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns the eigenvalues and the matrix whose columns are the matching
/// eigenvectors. Eigenvalues are not sorted.
fn jacobi_eigen(mut a: Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);
    let scale = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    if scale == 0. {
        return (Array1::zeros(n), v);
    }

    for _ in 0..MAX_SWEEPS {
        let off = (0..n)
            .flat_map(|p| (p + 1..n).map(move |q| (p, q)))
            .map(|(p, q)| a[[p, q]] * a[[p, q]])
            .sum::<f64>()
            .sqrt();
        if off <= JACOBI_EPS * scale {
            break;
        }

        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq == 0. {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2. * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.).sqrt());
                let c = 1. / (t * t + 1.).sqrt();
                let s = t * c;

                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    (a.diag().to_owned(), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Points stretched along (1, 1) with a little noise across it.
    fn diagonal_cloud(n: usize) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(7);
        let mut x = Descriptors::zeros((n, 2));
        for mut row in x.rows_mut() {
            let along: f32 = rng.gen_range(-10.0..10.0);
            let across: f32 = rng.gen_range(-0.5..0.5);
            row[0] = along + across + 3.;
            row[1] = along - across - 1.;
        }
        x
    }

    #[test]
    fn jacobi_diagonalizes_symmetric_matrix() {
        let m = array![[4., 1., 0.], [1., 3., 0.5], [0., 0.5, 2.]];
        let (vals, vecs) = jacobi_eigen(m.clone());
        let reconstructed = vecs.dot(&Array2::from_diag(&vals)).dot(&vecs.t());
        for (a, b) in reconstructed.iter().zip(m.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        // Trace is preserved
        assert!((vals.sum() - 9.).abs() < 1e-9);
    }

    #[test]
    fn finds_dominant_axis() {
        let x = diagonal_cloud(500);
        let pca = Pca::fit(x.view(), 1).unwrap();
        let axis = pca.components.row(0);
        let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
        assert!((axis[0] - inv_sqrt2).abs() < 1e-2);
        assert!((axis[1] - inv_sqrt2).abs() < 1e-2);
        assert_eq!(pca.input_dim(), 2);
        assert_eq!(pca.output_dim(), 1);
    }

    #[test]
    fn transformed_training_data_is_centered_and_sorted() {
        let x = diagonal_cloud(500);
        let pca = Pca::fit(x.view(), 2).unwrap();
        let y = pca.transform(x.view()).unwrap();
        let mean = y.mean_axis(Axis(0)).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-6));

        let var = y.var_axis(Axis(0), 1.);
        assert!(var[0] > var[1]);
        for (v, e) in var.iter().zip(pca.explained_variance()) {
            assert!((v - e).abs() / e < 1e-6);
        }
    }

    #[test]
    fn variance_does_not_depend_on_offset() {
        let x = diagonal_cloud(300);
        let shifted = x.mapv(|v| v + 100.);
        let a = Pca::fit(x.view(), 2).unwrap();
        let b = Pca::fit(shifted.view(), 2).unwrap();
        for (p, q) in a.explained_variance().iter().zip(b.explained_variance()) {
            assert!((p - q).abs() / p < 1e-3);
        }
    }

    #[test]
    fn refit_gives_identical_projection() {
        let x = diagonal_cloud(200);
        let a = Pca::fit(x.view(), 2).unwrap();
        let b = Pca::fit(x.view(), 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let x = diagonal_cloud(50);
        let pca = Pca::fit(x.view(), 1).unwrap();
        let wrong = Descriptors::zeros((3, 5));
        assert!(matches!(
            pca.transform(wrong.view()),
            Err(FvErr::DimensionMismatch {
                expected: 2,
                found: 5
            })
        ));
    }

    #[test]
    fn rejects_bad_parameters() {
        let x = diagonal_cloud(50);
        assert!(Pca::fit(x.view(), 0).is_err());
        assert!(Pca::fit(x.view(), 3).is_err());
        let single = Descriptors::zeros((1, 2));
        assert!(Pca::fit(single.view(), 1).is_err());
    }
}
