use serde::Serialize;

use crate::*;

/// One ranked corpus image.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Rank every image of `index` by decreasing cosine similarity to `query`.
///
/// The sort is stable: images with equal scores keep the index insertion
/// order, so repeated calls give the same ranking. The result is a
/// permutation of the index ids.
pub fn rank(query: &FisherVector, index: &CorpusIndex) -> FvResult<Vec<Hit>> {
    if query.len() != index.dim() {
        return Err(FvErr::DimensionMismatch {
            expected: index.dim(),
            found: query.len(),
        });
    }
    let mut hits: Vec<Hit> = index
        .iter()
        .map(|(id, fv)| Hit {
            id: id.to_owned(),
            // + 0. turns -0. into 0. so that both compare equal below
            score: query.cosine(fv) + 0.,
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(hits)
}

/// The `k` best hits of a ranking (all of them if there are fewer).
pub fn top_k(ranking: &[Hit], k: usize) -> &[Hit] {
    &ranking[..k.min(ranking.len())]
}
