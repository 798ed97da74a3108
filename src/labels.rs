use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::index::image_id;
use crate::*;

/// Extension of the word images.
const IMAGE_EXT: &str = "png";
/// Fields of a `words.txt` line before the transcription.
const WORDS_FIELDS: usize = 8;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
/// Ground-truth transcription of each word image, keyed by image id.
pub struct LabelMap(HashMap<String, String>);

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: String, label: String) {
        self.0.insert(id, label);
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.0.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse an IAM `words.txt` listing.
    ///
    /// Each line reads `<word-id> <status> <graylevel> <x> <y> <w> <h> <tag>
    /// <transcription>`; `#` lines are comments. The image id of a word is
    /// `<word-id>.png`.
    pub fn from_words_txt<R: BufRead>(reader: R) -> FvResult<Self> {
        let mut labels = Self::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() <= WORDS_FIELDS {
                return Err(FvErr::InvalidParameter(format!(
                    "words.txt line {}: expected at least {} fields",
                    n + 1,
                    WORDS_FIELDS + 1
                )));
            }
            labels.insert(
                format!("{}.{}", fields[0], IMAGE_EXT),
                fields[WORDS_FIELDS..].join(" "),
            );
        }
        Ok(labels)
    }

    pub fn from_words_file<P: AsRef<Path>>(file: P) -> FvResult<Self> {
        Self::from_words_txt(BufReader::new(File::open(file)?))
    }
}

impl FromIterator<(String, String)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(feature = "bincode")]
impl Persist for LabelMap {}

#[cfg(feature = "bincode")]
impl LabelMap {
    /// Parse `words` once and reuse the parsed map saved in `cache` for as
    /// long as the cache is not older than `words`.
    ///
    /// An unreadable or stale cache is rebuilt.
    pub fn from_words_file_cached<P, Q>(words: P, cache: Q) -> FvResult<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let (words, cache) = (words.as_ref(), cache.as_ref());
        let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
        if let (Some(cached), Some(source)) = (modified(cache), modified(words)) {
            if cached >= source {
                match Self::load(cache) {
                    Ok(labels) => {
                        debug!("Labels read from cache {}", cache.display());
                        return Ok(labels);
                    }
                    Err(e) => warn!("Ignoring label cache {}: {}", cache.display(), e),
                }
            }
        }
        let labels = Self::from_words_file(words)?;
        info!("Parsed {} labels from {}", labels.len(), words.display());
        if let Err(e) = labels.save(cache) {
            warn!("Cannot write label cache {}: {}", cache.display(), e);
        }
        Ok(labels)
    }
}

/// All word images under `root`, recursively, in path order.
pub fn discover_images<P: AsRef<Path>>(root: P) -> FvResult<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().map_or(false, |e| e == IMAGE_EXT) {
            images.push(path.to_path_buf());
        }
    }
    Ok(images)
}

/// Image id to absolute path, to show retrieved images.
#[derive(Debug, Default, Clone)]
pub struct ImagePaths(HashMap<String, PathBuf>);

impl ImagePaths {
    /// Map every word image under `root`.
    pub fn scan<P: AsRef<Path>>(root: P) -> FvResult<Self> {
        let root = std::fs::canonicalize(root)?;
        Ok(Self::from_paths(discover_images(root)?))
    }

    pub fn from_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> Self {
        Self(paths.into_iter().map(|p| (image_id(&p), p)).collect())
    }

    pub fn get(&self, id: &str) -> Option<&Path> {
        self.0.get(id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
