use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use wordfv::*;

const DESC_DIM: usize = 16;

/// Descriptors of a word written in `style`: noisy copies of the style's
/// four cluster centers.
fn word_descriptors(style: u64, seed: u64, n: usize) -> Descriptors {
    let mut centers_rng = StdRng::seed_from_u64(1000 + style);
    let centers: Vec<Vec<f32>> = (0..4)
        .map(|_| (0..DESC_DIM).map(|_| centers_rng.gen_range(-5.0f32..5.0)).collect())
        .collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(n * DESC_DIM);
    for _ in 0..n {
        let c = &centers[rng.gen_range(0..centers.len())];
        data.extend(c.iter().map(|v| v + rng.gen_range(-0.5f32..0.5)));
    }
    Array2::from_shape_vec((n, DESC_DIM), data).unwrap()
}

/// In-memory descriptor source; unknown paths fail like an unreadable image.
struct Corpus {
    descriptors: HashMap<PathBuf, Descriptors>,
}

impl DescriptorSource for Corpus {
    fn extract(&self, image: &Path) -> FvResult<Descriptors> {
        let d = self
            .descriptors
            .get(image)
            .cloned()
            .ok_or_else(|| FvErr::Extraction(format!("cannot read {}", image.display())))?;
        if d.nrows() == 0 {
            return Err(FvErr::NoDescriptors);
        }
        Ok(d)
    }
}

struct Fixture {
    source: Corpus,
    labels: LabelMap,
    corpus: Vec<PathBuf>,
    model: Model,
}

fn fixture() -> Fixture {
    let mut descriptors = HashMap::new();
    let mut labels = LabelMap::new();
    let mut corpus = Vec::new();
    for (style, word) in [(1, "the"), (2, "of")] {
        for i in 0..3u64 {
            let path = PathBuf::from(format!("/corpus/{}_{}.png", word, i));
            descriptors.insert(path.clone(), word_descriptors(style, style * 100 + i, 40));
            labels.insert(format!("{}_{}.png", word, i), word.to_string());
            corpus.push(path);
        }
        let query = PathBuf::from(format!("/queries/{}_q.png", word));
        descriptors.insert(query, word_descriptors(style, style * 100 + 50, 40));
        labels.insert(format!("{}_q.png", word), word.to_string());
    }
    // Readable but textureless, and unreadable
    descriptors.insert(PathBuf::from("/corpus/blank.png"), Descriptors::zeros((0, DESC_DIM)));
    corpus.push(PathBuf::from("/corpus/blank.png"));
    corpus.push(PathBuf::from("/corpus/broken.png"));
    labels.insert("blank.png".into(), "the".into());
    // Encodable but missing from the transcriptions
    descriptors.insert(
        PathBuf::from("/queries/unlabeled.png"),
        word_descriptors(1, 999, 40),
    );

    let source = Corpus { descriptors };
    let params = Params {
        n_components: 8,
        n_gaussians: 4,
        ..Params::default()
    };
    let model = Model::train_from_images(&corpus, &source, &params).unwrap();
    Fixture {
        source,
        labels,
        corpus,
        model,
    }
}

#[test]
fn fisher_vector_length_and_norm() {
    let mut rng = StdRng::seed_from_u64(17);
    let training = Array2::from_shape_fn((800, 128), |_| rng.gen_range(0.0f32..1.0));
    let params = Params {
        n_components: 64,
        n_gaussians: 16,
        gmm: GmmParams {
            max_iter: 20,
            ..GmmParams::default()
        },
        ..Params::default()
    };
    let model = Model::train(training.view(), &params).unwrap();
    assert_eq!(model.gmm().n_components(), 16);
    assert!((model.gmm().weights().sum() - 1.).abs() < 1e-9);

    let image = Array2::from_shape_fn((50, 128), |_| rng.gen_range(0.0f32..1.0));
    let fv = model.encode(image.view()).unwrap();
    assert_eq!(fv.len(), 16 * (1 + 2 * 64));
    assert_eq!(fv.len(), 2064);
    assert!((fv.l2_norm() - 1.).abs() < 1e-5);
    assert_eq!(model.encode(image.view()).unwrap(), fv);
}

#[test]
fn failed_images_are_left_out_of_the_index() {
    let f = fixture();
    let (index, report) = IndexBuilder::new(&f.model)
        .build(&f.corpus, &f.source)
        .unwrap();

    assert_eq!(index.len(), 6);
    assert_eq!(report.indexed, 6);
    assert_eq!(report.skipped.len(), 2);
    assert!(!index.contains("blank.png"));
    assert!(!index.contains("broken.png"));
    assert!(matches!(report.skipped[0].1, FvErr::NoDescriptors));
    assert!(matches!(report.skipped[1].1, FvErr::Extraction(_)));

    // Corpus order is kept
    let ids: Vec<&str> = index.ids().collect();
    assert_eq!(ids, vec!["the_0.png", "the_1.png", "the_2.png", "of_0.png", "of_1.png", "of_2.png"]);
    for (_, fv) in index.iter() {
        assert!((fv.l2_norm() - 1.).abs() < 1e-5);
    }
}

#[test]
fn same_word_ranks_first() {
    let f = fixture();
    let (index, _) = IndexBuilder::new(&f.model)
        .build(&f.corpus, &f.source)
        .unwrap();
    let evaluator = Evaluator::new(&f.model, &index, &f.labels, &f.source).unwrap();

    let result = evaluator.query(Path::new("/queries/the_q.png")).unwrap();
    let best: Vec<&str> = top_k(&result.ranking, 3).iter().map(|h| h.id.as_str()).collect();
    let mut sorted = best.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["the_0.png", "the_1.png", "the_2.png"]);
    assert_eq!(result.average_precision, 1.);

    // The ranking is a permutation of the index, by decreasing score
    assert_eq!(result.ranking.len(), index.len());
    assert!(result.ranking.windows(2).all(|w| w[0].score >= w[1].score));
    let mut ranked: Vec<&str> = result.ranking.iter().map(|h| h.id.as_str()).collect();
    let mut all: Vec<&str> = index.ids().collect();
    ranked.sort();
    all.sort();
    assert_eq!(ranked, all);
}

#[test]
fn batch_evaluation_counts_failures() {
    let f = fixture();
    let (index, _) = IndexBuilder::new(&f.model)
        .build(&f.corpus, &f.source)
        .unwrap();
    let evaluator = Evaluator::new(&f.model, &index, &f.labels, &f.source).unwrap();

    let queries = [
        PathBuf::from("/queries/the_q.png"),
        PathBuf::from("/queries/of_q.png"),
        PathBuf::from("/queries/missing.png"),
        PathBuf::from("/queries/unlabeled.png"),
    ];
    let report = evaluator.evaluate(&queries).unwrap();
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.zero_scored, 1);
    assert_eq!(report.skipped, 1);
    assert!((report.mean_ap - 2. / 3.).abs() < 1e-9);
}

#[test]
fn cancelled_build_returns_nothing() {
    let f = fixture();
    let flag = AtomicBool::new(true);
    let res = IndexBuilder::new(&f.model)
        .cancel_flag(&flag)
        .build(&f.corpus, &f.source);
    assert!(matches!(res, Err(FvErr::Cancelled)));
}

#[test]
fn foreign_descriptor_dimension_aborts_the_build() {
    let mut f = fixture();
    let odd = PathBuf::from("/corpus/odd.png");
    f.source
        .descriptors
        .insert(odd.clone(), Descriptors::ones((10, DESC_DIM + 1)));
    f.corpus.push(odd);
    let res = IndexBuilder::new(&f.model).build(&f.corpus, &f.source);
    assert!(matches!(res, Err(FvErr::DimensionMismatch { .. })));
}

#[test]
fn index_from_another_model_is_rejected() {
    let f = fixture();
    let index = CorpusIndex::new(f.model.fv_len() + 1);
    assert!(Evaluator::new(&f.model, &index, &f.labels, &f.source).is_err());
}

#[cfg(feature = "bincode")]
#[test]
fn persisted_artifacts_give_the_same_ranking() {
    let f = fixture();
    let (index, _) = IndexBuilder::new(&f.model)
        .build(&f.corpus, &f.source)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    f.model.save(dir.path().join("model.bin")).unwrap();
    index.save(dir.path().join("index.bin")).unwrap();
    f.labels.save(dir.path().join("labels.bin")).unwrap();

    let model = Model::load(dir.path().join("model.bin")).unwrap();
    let loaded = CorpusIndex::load(dir.path().join("index.bin")).unwrap();
    let labels = LabelMap::load(dir.path().join("labels.bin")).unwrap();
    assert_eq!(labels, f.labels);

    let query = Path::new("/queries/of_q.png");
    let before = Evaluator::new(&f.model, &index, &f.labels, &f.source)
        .unwrap()
        .query(query)
        .unwrap();
    let after = Evaluator::new(&model, &loaded, &labels, &f.source)
        .unwrap()
        .query(query)
        .unwrap();
    assert_eq!(before.ranking, after.ranking);
    assert_eq!(after.average_precision, 1.);
}
