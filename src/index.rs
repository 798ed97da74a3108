use indicatif::ProgressBar;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::*;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(try_from = "IndexEntries")]
/// Fisher Vectors of a corpus, keyed by image id (the image file name).
///
/// Entries keep their insertion order, which is the tie-break order of
/// [`rank`](crate::rank). Ids are unique. A deserialized index is rebuilt
/// entry by entry through [`CorpusIndex::insert`].
pub struct CorpusIndex {
    dim: usize,
    entries: Vec<(String, FisherVector)>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

/// Serialized form of a [`CorpusIndex`].
#[derive(Deserialize)]
struct IndexEntries {
    dim: usize,
    entries: Vec<(String, FisherVector)>,
}

impl TryFrom<IndexEntries> for CorpusIndex {
    type Error = FvErr;

    fn try_from(raw: IndexEntries) -> FvResult<Self> {
        let mut index = CorpusIndex::new(raw.dim);
        for (id, fv) in raw.entries {
            index.insert(id, fv)?;
        }
        Ok(index)
    }
}

impl CorpusIndex {
    /// Empty index accepting vectors of length `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Append a vector. Inserting an id twice is an error, the first vector is kept.
    pub fn insert(&mut self, id: String, fv: FisherVector) -> FvResult<()> {
        if fv.len() != self.dim {
            return Err(FvErr::DimensionMismatch {
                expected: self.dim,
                found: fv.len(),
            });
        }
        if self.positions.contains_key(&id) {
            return Err(FvErr::DuplicateKey(id));
        }
        self.positions.insert(id.clone(), self.entries.len());
        self.entries.push((id, fv));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&FisherVector> {
        self.positions.get(id).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FisherVector)> + '_ {
        self.entries.iter().map(|(id, fv)| (id.as_str(), fv))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the stored Fisher Vectors.
    pub fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(feature = "bincode")]
impl Persist for CorpusIndex {}

/// Outcome of an index build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub indexed: usize,
    /// Images left out of the index and why.
    pub skipped: Vec<(PathBuf, FvErr)>,
}

/// Encodes a corpus into a [`CorpusIndex`].
///
/// Images are encoded in parallel; the index lists them in input order.
/// Images that cannot be encoded (no descriptors, unreadable file, zero
/// vector) are skipped and reported. Any other error stops the build at
/// the first image that raises it.
pub struct IndexBuilder<'a> {
    model: &'a Model,
    cancel: Option<&'a AtomicBool>,
    progress: Option<ProgressBar>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            cancel: None,
            progress: None,
        }
    }

    /// Stop between images once `flag` is set. A cancelled build returns
    /// [`FvErr::Cancelled`] and no partial index.
    pub fn cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Advance `pb` once per processed image.
    pub fn progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    pub fn build<P, S>(&self, images: &[P], source: &S) -> FvResult<(CorpusIndex, BuildReport)>
    where
        P: AsRef<Path> + Sync,
        S: DescriptorSource + ?Sized,
    {
        let cancelled = || self.cancel.map_or(false, |c| c.load(Ordering::Relaxed));
        info!("Encoding {} images", images.len());

        // Outer error: stop the whole build. Inner error: skip that image.
        let encoded: Vec<FvResult<FisherVector>> = images
            .par_iter()
            .map(|path| {
                if cancelled() {
                    return Err(FvErr::Cancelled);
                }
                let fv = source
                    .extract(path.as_ref())
                    .and_then(|d| self.model.encode(d.view()));
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
                match fv {
                    Err(e) if !e.is_recoverable() => Err(e),
                    fv => Ok(fv),
                }
            })
            .collect::<FvResult<_>>()?;
        if cancelled() {
            return Err(FvErr::Cancelled);
        }

        let mut index = CorpusIndex::new(self.model.fv_len());
        let mut report = BuildReport::default();
        for (path, fv) in images.iter().zip(encoded) {
            let path = path.as_ref();
            match fv {
                Ok(fv) => {
                    index.insert(image_id(path), fv)?;
                    report.indexed += 1;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    report.skipped.push((path.to_path_buf(), e));
                }
            }
        }
        info!(
            "Indexed {} images, skipped {}",
            report.indexed,
            report.skipped.len()
        );
        Ok((index, report))
    }
}

/// Identifier of an image in the index and the label map: its file name.
pub fn image_id(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
