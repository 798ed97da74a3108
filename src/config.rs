use serde::{Deserialize, Serialize};

/// Parameters of a training + retrieval run.
///
/// Stored alongside the trained [`Model`](crate::Model) so that queries
/// are answered with the settings the model was trained with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Params {
    /// Reduced descriptor dimension `D`.
    pub n_components: usize,
    /// Number of Gaussians `K` in the dictionary.
    pub n_gaussians: usize,
    /// Components with weight at or under this value are dropped after training.
    pub weight_threshold: f64,
    pub gmm: GmmParams,
    /// Number of hits shown for a single query.
    pub top_k: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            n_components: 64,
            n_gaussians: 16,
            weight_threshold: 0.,
            gmm: GmmParams::default(),
            top_k: 5,
        }
    }
}

/// Expectation-Maximization settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GmmParams {
    pub max_iter: usize,
    /// Convergence threshold on the change of the mean log-likelihood.
    pub tol: f64,
    /// Added to every variance after each M-step.
    pub reg_covar: f64,
    /// Seed of the k-means++ initialization.
    pub seed: u64,
}

impl Default for GmmParams {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            seed: 0,
        }
    }
}
