use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};

use crate::*;

/// Produces the local descriptors of an image.
///
/// Failures are returned, never panicked: batch callers decide from
/// [`FvErr::is_recoverable`] whether to skip the image. An image without
/// keypoints is [`FvErr::NoDescriptors`].
pub trait DescriptorSource: Sync {
    fn extract(&self, image: &Path) -> FvResult<Descriptors>;
}

impl<F> DescriptorSource for F
where
    F: Fn(&Path) -> FvResult<Descriptors> + Sync,
{
    fn extract(&self, image: &Path) -> FvResult<Descriptors> {
        self(image)
    }
}

/// Reads descriptors precomputed by an external extractor.
///
/// The descriptors of `dir/a01-000u-00-00.png` are expected in
/// `a01-000u-00-00.npy` (a `T x d` `f32` array), next to the image or in
/// the configured descriptor directory.
#[derive(Debug, Clone, Default)]
pub struct NpySource {
    dir: Option<PathBuf>,
}

impl NpySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for descriptor files in `dir` instead of next to the images.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    pub fn descriptor_path(&self, image: &Path) -> PathBuf {
        let file = image.with_extension("npy");
        match (&self.dir, file.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => file,
        }
    }
}

impl DescriptorSource for NpySource {
    fn extract(&self, image: &Path) -> FvResult<Descriptors> {
        let descriptors: Descriptors = read_npy(self.descriptor_path(image))?;
        if descriptors.nrows() == 0 {
            return Err(FvErr::NoDescriptors);
        }
        Ok(descriptors)
    }
}

#[cfg(feature = "opencv")]
pub use sift::SiftSource;

#[cfg(feature = "opencv")]
mod sift {
    use opencv::{core, features2d, imgcodecs, imgproc, prelude::*};
    use std::path::Path;

    use crate::*;

    /// Use opencv to load an image and extract SIFT keypoint descriptors.
    ///
    /// Images are read in grayscale and resized to a `size x size` square first.
    #[derive(Debug, Clone)]
    pub struct SiftSource {
        size: i32,
    }

    impl Default for SiftSource {
        fn default() -> Self {
            Self { size: 256 }
        }
    }

    impl SiftSource {
        pub fn with_size(size: i32) -> Self {
            Self { size }
        }
    }

    impl DescriptorSource for SiftSource {
        fn extract(&self, image: &Path) -> FvResult<Descriptors> {
            let path = image
                .to_str()
                .ok_or_else(|| FvErr::Extraction(format!("non UTF-8 path {}", image.display())))?;
            let img = imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE)?;
            if img.empty() {
                return Err(FvErr::Extraction(format!("cannot read {}", path)));
            }
            let mut resized = Mat::default();
            imgproc::resize(
                &img,
                &mut resized,
                core::Size::new(self.size, self.size),
                0.,
                0.,
                imgproc::INTER_LINEAR,
            )?;

            // Detect keypoints and compute descriptors
            let mut sift = features2d::SIFT::create_def()?;
            let mut kps = core::Vector::<core::KeyPoint>::new();
            let mut desc = Mat::default();
            let mask = Mat::default();
            sift.detect_and_compute(&resized, &mask, &mut kps, &mut desc, false)?;
            if desc.rows() == 0 {
                return Err(FvErr::NoDescriptors);
            }

            // Copy data from CvMat into descriptor buffer
            let shape = (desc.rows() as usize, desc.cols() as usize);
            let data = desc.data_typed::<f32>()?.to_vec();
            Descriptors::from_shape_vec(shape, data).map_err(|e| FvErr::Extraction(e.to_string()))
        }
    }
}
