use ndarray::Array2;
use thiserror::Error;

/// Run parameters shared by training and retrieval.
pub mod config;
pub use config::{GmmParams, Params};

/// Principal component analysis used to reduce raw descriptors.
pub mod pca;
pub use pca::Pca;

/// Diagonal-covariance Gaussian mixture, the visual-word dictionary.
pub mod gmm;
pub use gmm::Gmm;

/// Fisher Vector encoding of a descriptor set against a [`Gmm`].
pub mod fisher;

/// Trained reducer + dictionary pair, which provides the main functionality of this crate.
pub mod model;
pub use model::Model;

/// Sources of local keypoint descriptors.
pub mod source;
pub use source::{DescriptorSource, NpySource};
#[cfg(feature = "opencv")]
pub use source::SiftSource;

/// Corpus index of Fisher Vectors and its builder.
pub mod index;
pub use index::{BuildReport, CorpusIndex, IndexBuilder};

/// Similarity ranking of a query against a corpus index.
pub mod retrieval;
pub use retrieval::{rank, top_k, Hit};

/// Ranking quality (average precision) against ground-truth labels.
pub mod eval;
pub use eval::{average_precision, BatchReport, Evaluator};

/// Ground-truth labels and image discovery.
pub mod labels;
pub use labels::{discover_images, ImagePaths, LabelMap};

/// Local descriptors of one image, one row per keypoint.
///
/// Rows are typically 128-dimensional SIFT descriptors. The dimension must be
/// the same for every image of a run.
pub type Descriptors = Array2<f32>;

/// Fisher Vector representation of an image.
///
/// Layout: `K` weight gradients, then `K * D` mean gradients, then `K * D`
/// variance gradients, power and L2 normalized.
pub type FisherVector = Vec<f32>;

/// Provides method(s) for computing the similarity score between Fisher Vectors.
pub trait FvTrait {
    /// Euclidean norm.
    fn l2_norm(&self) -> f32;
    /// Cosine similarity. Zero if either vector has zero norm.
    fn cosine(&self, other: &Self) -> f32;
}

impl FvTrait for FisherVector {
    fn l2_norm(&self) -> f32 {
        self.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn cosine(&self, other: &Self) -> f32 {
        let (na, nb) = (self.l2_norm(), other.l2_norm());
        if na == 0. || nb == 0. {
            return 0.;
        }
        self.iter().zip(other).fold(0., |a, (b, c)| a + b * c) / (na * nb)
    }
}

/// Save & load through bincode, for the model, corpus index and label artifacts.
#[cfg(feature = "bincode")]
pub trait Persist: serde::Serialize + serde::de::DeserializeOwned {
    /// Load an artifact from a file
    fn load<P: AsRef<std::path::Path>>(file: P) -> FvResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    /// Save artifact to a file
    fn save<P: AsRef<std::path::Path>>(&self, file: P) -> FvResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

pub type FvResult<T> = std::result::Result<T, FvErr>;

#[derive(Error, Debug)]
pub enum FvErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Model Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[error("Descriptor file error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
    #[cfg(feature = "opencv")]
    #[error("Opencv Error")]
    OpenCv(#[from] opencv::Error),
    #[error("Descriptor extraction failed: {0}")]
    Extraction(String),
    #[error("No descriptors")]
    NoDescriptors,
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Singular covariance in component {component}")]
    SingularCovariance { component: usize },
    #[error("Degenerate training data: {0}")]
    DegenerateTraining(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Fisher Vector has zero norm")]
    ZeroVector,
    #[error("No label for {0}")]
    UnknownLabel(String),
    #[error("Duplicate image id {0}")]
    DuplicateKey(String),
    #[error("Cancelled")]
    Cancelled,
}

impl FvErr {
    /// Whether the error only concerns the image being processed.
    ///
    /// Recoverable errors skip that image in batch runs. Everything else
    /// invalidates downstream results and aborts.
    pub fn is_recoverable(&self) -> bool {
        match self {
            FvErr::Io(_) | FvErr::Npy(_) | FvErr::Extraction(_) => true,
            FvErr::NoDescriptors | FvErr::ZeroVector => true,
            #[cfg(feature = "opencv")]
            FvErr::OpenCv(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors() {
        let a: FisherVector = vec![1., 2., 3.];
        let b: FisherVector = vec![2., 4., 6.];
        assert!((a.cosine(&b) - 1.).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector() {
        let a: FisherVector = vec![1., 2., 3.];
        let z: FisherVector = vec![0.; 3];
        assert_eq!(a.cosine(&z), 0.);
    }

    #[test]
    fn recoverable_errors() {
        assert!(FvErr::NoDescriptors.is_recoverable());
        assert!(FvErr::ZeroVector.is_recoverable());
        assert!(!FvErr::DimensionMismatch { expected: 128, found: 64 }.is_recoverable());
        assert!(!FvErr::UnknownLabel("x.png".into()).is_recoverable());
    }
}
