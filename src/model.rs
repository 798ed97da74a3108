use log::{info, warn};
use ndarray::{concatenate, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::*;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
/// Trained encoding model: the frozen reducer and the dictionary fitted on
/// its output. Can be:
/// 1. Trained from a collection of descriptors or images.
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Used to transform a new set of descriptors into its Fisher Vector.
///
/// Read-only once built; share it by reference between encoding threads.
pub struct Model {
    params: Params,
    pca: Pca,
    gmm: Gmm,
}

/// Model API
impl Model {
    /// Encode one image's raw descriptors.
    pub fn encode(&self, descriptors: ArrayView2<'_, f32>) -> FvResult<FisherVector> {
        fisher::encode(descriptors, &self.pca, &self.gmm)
    }

    /// Train on a stack of descriptors pooled from the training images.
    pub fn train(descriptors: ArrayView2<'_, f32>, params: &Params) -> FvResult<Self> {
        let pca = Pca::fit(descriptors, params.n_components)?;
        let gmm = {
            let reduced = pca.transform(descriptors)?;
            Gmm::fit(reduced.view(), params.n_gaussians, &params.gmm)?
        };
        let gmm = gmm.filter_weights(params.weight_threshold)?;
        info!("Trained dictionary: {:?}", gmm);
        Ok(Self {
            params: params.clone(),
            pca,
            gmm,
        })
    }

    /// Extract descriptors of every image and train on their union.
    ///
    /// Images whose extraction fails are skipped; a mismatched descriptor
    /// dimension aborts.
    pub fn train_from_images<P, S>(images: &[P], source: &S, params: &Params) -> FvResult<Self>
    where
        P: AsRef<Path>,
        S: DescriptorSource + ?Sized,
    {
        info!("Calculating descriptors. Number of images is {}", images.len());
        let mut all: Vec<Descriptors> = Vec::with_capacity(images.len());
        let mut skipped = 0;
        for path in images {
            match source.extract(path.as_ref()) {
                Ok(d) => {
                    if let Some(first) = all.first() {
                        if first.ncols() != d.ncols() {
                            return Err(FvErr::DimensionMismatch {
                                expected: first.ncols(),
                                found: d.ncols(),
                            });
                        }
                    }
                    all.push(d);
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping {}: {}", path.as_ref().display(), e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if all.is_empty() {
            return Err(FvErr::DegenerateTraining(
                "no training image yielded descriptors".into(),
            ));
        }
        let n_images = all.len();
        let stacked = {
            let views: Vec<_> = all.iter().map(|d| d.view()).collect();
            concatenate(Axis(0), &views).map_err(|e| FvErr::InvalidParameter(e.to_string()))?
        };
        drop(all);
        info!(
            "Pooled {} descriptors from {} images ({} skipped)",
            stacked.nrows(),
            n_images,
            skipped
        );
        Self::train(stacked.view(), params)
    }

    /// Assemble a model from separately obtained parts.
    pub fn from_parts(params: Params, pca: Pca, gmm: Gmm) -> FvResult<Self> {
        if pca.output_dim() != gmm.dim() {
            return Err(FvErr::DimensionMismatch {
                expected: pca.output_dim(),
                found: gmm.dim(),
            });
        }
        Ok(Self { params, pca, gmm })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn pca(&self) -> &Pca {
        &self.pca
    }

    pub fn gmm(&self) -> &Gmm {
        &self.gmm
    }

    /// Length of the Fisher Vectors this model produces.
    pub fn fv_len(&self) -> usize {
        self.gmm.fv_len()
    }
}

#[cfg(feature = "bincode")]
impl Persist for Model {}
