use bitvec::prelude::*;
use indicatif::ProgressBar;
use log::warn;
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

use crate::index::image_id;
use crate::*;

/// Average precision of a ranking for the query image `query_id`.
///
/// A candidate is relevant when its label equals the query's label; a
/// candidate without a label is never relevant. Ties in score are resolved
/// pessimistically, as in label ranking average precision: every member of
/// a tie group is ranked at the end of the group. Without ties this is
/// `(1/R) * sum of Precision@k over the ranks k of relevant items`.
///
/// `ranking` must be sorted by decreasing score, as returned by [`rank`].
/// A ranking without any relevant item scores 0.
pub fn average_precision(query_id: &str, ranking: &[Hit], labels: &LabelMap) -> FvResult<f64> {
    let query_label = labels
        .get(query_id)
        .ok_or_else(|| FvErr::UnknownLabel(query_id.to_owned()))?;
    let mut relevant: BitVec = BitVec::repeat(false, ranking.len());
    for (i, hit) in ranking.iter().enumerate() {
        if labels.get(&hit.id) == Some(query_label) {
            relevant.set(i, true);
        }
    }
    Ok(ranked_precision(ranking, &relevant))
}

fn ranked_precision(ranking: &[Hit], relevant: &BitSlice) -> f64 {
    debug_assert!(ranking.windows(2).all(|w| w[0].score >= w[1].score));
    let n_relevant = relevant.count_ones();
    if n_relevant == 0 {
        return 0.;
    }

    let (mut sum, mut seen, mut start) = (0., 0, 0);
    while start < ranking.len() {
        let end = start
            + ranking[start..]
                .iter()
                .take_while(|h| h.score == ranking[start].score)
                .count();
        let group = (start..end).filter(|&i| relevant[i]).count();
        seen += group;
        // Each relevant member of the group has rank `end`
        sum += group as f64 * seen as f64 / end as f64;
        start = end;
    }
    sum / n_relevant as f64
}

/// Outcome of one query.
#[derive(Serialize, Debug)]
pub struct QueryResult {
    pub id: String,
    pub average_precision: f64,
    pub ranking: Vec<Hit>,
    /// Why the query image could not be encoded. It then scores 0 and its
    /// ranking is empty.
    #[serde(skip)]
    pub failure: Option<FvErr>,
}

/// Aggregate of a batch evaluation.
#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    /// Queries contributing to the mean, zero-scored ones included.
    pub evaluated: usize,
    /// Queries scored 0 because they could not be encoded.
    pub zero_scored: usize,
    /// Queries left out because their label is unknown.
    pub skipped: usize,
    pub mean_ap: f64,
}

/// Evaluates query images against a corpus index.
pub struct Evaluator<'a, S: ?Sized> {
    model: &'a Model,
    index: &'a CorpusIndex,
    labels: &'a LabelMap,
    source: &'a S,
    progress: Option<ProgressBar>,
}

impl<'a, S: DescriptorSource + ?Sized> Evaluator<'a, S> {
    /// Fails if the index was not built with a model of the same shape.
    pub fn new(
        model: &'a Model,
        index: &'a CorpusIndex,
        labels: &'a LabelMap,
        source: &'a S,
    ) -> FvResult<Self> {
        if index.dim() != model.fv_len() {
            return Err(FvErr::DimensionMismatch {
                expected: model.fv_len(),
                found: index.dim(),
            });
        }
        Ok(Self {
            model,
            index,
            labels,
            source,
            progress: None,
        })
    }

    /// Advance `pb` once per evaluated query.
    pub fn progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    /// Encode, rank and score one query image.
    ///
    /// The query is ranked against the whole index, itself included when
    /// it is part of the corpus. A query image without descriptors, or whose
    /// vector is zero, scores 0 and carries the failure.
    pub fn query(&self, image: &Path) -> FvResult<QueryResult> {
        let id = image_id(image);
        let encoded = self
            .source
            .extract(image)
            .and_then(|d| self.model.encode(d.view()));
        let fv = match encoded {
            Ok(fv) => fv,
            Err(e) if e.is_recoverable() => {
                warn!("Scoring {} as 0: {}", image.display(), e);
                return Ok(QueryResult {
                    id,
                    average_precision: 0.,
                    ranking: Vec::new(),
                    failure: Some(e),
                });
            }
            Err(e) => return Err(e),
        };
        let ranking = rank(&fv, self.index)?;
        let average_precision = average_precision(&id, &ranking, self.labels)?;
        Ok(QueryResult {
            id,
            average_precision,
            ranking,
            failure: None,
        })
    }

    /// Mean average precision over query images.
    ///
    /// Queries that cannot be encoded score 0; queries with an unknown
    /// label are skipped. Any other error aborts.
    pub fn evaluate<P: AsRef<Path> + Sync>(&self, queries: &[P]) -> FvResult<BatchReport> {
        let results: Vec<FvResult<QueryResult>> = queries
            .par_iter()
            .map(|q| {
                let res = self.query(q.as_ref());
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
                res
            })
            .collect();

        let mut report = BatchReport::default();
        let mut sum = 0.;
        for res in results {
            match res {
                Ok(r) => {
                    if r.failure.is_some() {
                        report.zero_scored += 1;
                    }
                    sum += r.average_precision;
                }
                Err(FvErr::UnknownLabel(id)) => {
                    warn!("No label for {}, query skipped", id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            report.evaluated += 1;
        }
        if report.evaluated > 0 {
            report.mean_ap = sum / report.evaluated as f64;
        }
        Ok(report)
    }
}
