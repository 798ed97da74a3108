use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::{Path, PathBuf};

use wordfv::*;

const MODEL_FILE: &str = "model.bin";
const INDEX_FILE: &str = "index.bin";
const LABELS_FILE: &str = "labels.bin";

#[derive(Parser, Debug)]
#[command(name = "wordfv", version, about = "Fisher Vector retrieval of handwritten word images")]
struct Opts {
    #[command(subcommand)]
    subcmd: SubCommand,
    /// Where descriptors come from
    #[arg(long, value_enum, default_value_t = SourceKind::Npy, global = true)]
    source: SourceKind,
    /// Directory holding the `<image-stem>.npy` descriptor files, instead of next to the images
    #[arg(long, value_name = "DIR", global = true)]
    descriptors: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
enum SourceKind {
    /// Precomputed descriptor files
    Npy,
    /// OpenCV SIFT (requires the `opencv` feature)
    Sift,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Train the reducer and the dictionary on a folder of word images
    Train(TrainCommand),
    /// Encode a folder of word images into the corpus index
    Index(IndexCommand),
    /// Mean average precision over a folder of query images
    Eval(EvalCommand),
    /// Rank the corpus for one query image
    Query(QueryCommand),
}

#[derive(Parser, Debug)]
struct TrainCommand {
    /// Training images, searched recursively for *.png
    #[arg(short, long)]
    images: PathBuf,
    /// Output directory of the model
    #[arg(short, long, default_value = ".")]
    model_dir: PathBuf,
    /// Number of Gaussians in the dictionary
    #[arg(short = 'n', long, default_value_t = 16)]
    gaussians: usize,
    /// Reduced descriptor dimension
    #[arg(long, default_value_t = 64)]
    components: usize,
    /// Drop Gaussians whose weight is at or under this value
    #[arg(long, default_value_t = 0.)]
    threshold: f64,
    /// Maximum EM iterations
    #[arg(long, default_value_t = 100)]
    max_iter: usize,
    /// Seed of the dictionary initialization
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Number of hits shown by `query`
    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

#[derive(Parser, Debug)]
struct IndexCommand {
    /// Corpus images, searched recursively for *.png
    #[arg(short, long)]
    images: PathBuf,
    /// Directory of the trained model; the index is written next to it
    #[arg(short, long, default_value = ".")]
    model_dir: PathBuf,
}

#[derive(Parser, Debug)]
struct EvalCommand {
    /// Query images, searched recursively for *.png
    #[arg(short, long)]
    queries: PathBuf,
    #[arg(short, long, default_value = ".")]
    model_dir: PathBuf,
    /// IAM words.txt with the transcription of every word
    #[arg(short, long)]
    labels: PathBuf,
}

#[derive(Parser, Debug)]
struct QueryCommand {
    /// Query image
    #[arg(short, long)]
    image: PathBuf,
    #[arg(short, long, default_value = ".")]
    model_dir: PathBuf,
    /// IAM words.txt with the transcription of every word
    #[arg(short, long)]
    labels: PathBuf,
    /// Corpus folder, to print the paths of the best matches
    #[arg(short, long)]
    corpus: Option<PathBuf>,
    /// Number of hits shown, defaults to the model's setting
    #[arg(short = 'k', long)]
    top: Option<usize>,
}

fn pb_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}")?)
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    Ok(ProgressBar::new(len as u64).with_style(pb_style()?))
}

fn make_source(opts: &Opts) -> Result<Box<dyn DescriptorSource>> {
    match opts.source {
        SourceKind::Npy => Ok(match &opts.descriptors {
            Some(dir) => Box::new(NpySource::in_dir(dir)),
            None => Box::new(NpySource::new()),
        }),
        #[cfg(feature = "opencv")]
        SourceKind::Sift => Ok(Box::new(SiftSource::default())),
        #[cfg(not(feature = "opencv"))]
        SourceKind::Sift => bail!("built without the `opencv` feature, SIFT extraction is unavailable"),
    }
}

fn images_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let images = discover_images(dir).with_context(|| format!("listing {}", dir.display()))?;
    if images.is_empty() {
        bail!("no *.png image under {}", dir.display());
    }
    Ok(images)
}

fn load_model(dir: &Path) -> Result<Model> {
    let file = dir.join(MODEL_FILE);
    Model::load(&file).with_context(|| format!("loading model {}", file.display()))
}

fn load_index(dir: &Path) -> Result<CorpusIndex> {
    let file = dir.join(INDEX_FILE);
    CorpusIndex::load(&file).with_context(|| format!("loading index {}", file.display()))
}

fn load_labels(file: &Path, model_dir: &Path) -> Result<LabelMap> {
    LabelMap::from_words_file_cached(file, model_dir.join(LABELS_FILE))
        .with_context(|| format!("reading labels {}", file.display()))
}

fn train(cmd: &TrainCommand, source: &dyn DescriptorSource) -> Result<()> {
    let params = Params {
        n_components: cmd.components,
        n_gaussians: cmd.gaussians,
        weight_threshold: cmd.threshold,
        gmm: GmmParams {
            max_iter: cmd.max_iter,
            seed: cmd.seed,
            ..GmmParams::default()
        },
        top_k: cmd.top_k,
    };
    let images = images_in(&cmd.images)?;
    let model = Model::train_from_images(&images, source, &params)?;
    std::fs::create_dir_all(&cmd.model_dir)?;
    let file = cmd.model_dir.join(MODEL_FILE);
    model.save(&file)?;
    info!("Model saved to {}: {:?}", file.display(), model.gmm());
    Ok(())
}

fn index(cmd: &IndexCommand, source: &dyn DescriptorSource, json: bool) -> Result<()> {
    let model = load_model(&cmd.model_dir)?;
    let images = images_in(&cmd.images)?;
    let pb = progress_bar(images.len())?;
    let (index, report) = IndexBuilder::new(&model)
        .progress(pb.clone())
        .build(&images, source)?;
    pb.finish_and_clear();

    let file = cmd.model_dir.join(INDEX_FILE);
    index.save(&file)?;
    if json {
        let skipped: Vec<_> = report
            .skipped
            .iter()
            .map(|(p, e)| serde_json::json!({ "image": p, "error": e.to_string() }))
            .collect();
        let out = serde_json::json!({ "indexed": report.indexed, "skipped": skipped });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "Indexed {} images into {} ({} skipped)",
            report.indexed,
            file.display(),
            report.skipped.len()
        );
    }
    Ok(())
}

fn eval(cmd: &EvalCommand, source: &dyn DescriptorSource, json: bool) -> Result<()> {
    let model = load_model(&cmd.model_dir)?;
    let index = load_index(&cmd.model_dir)?;
    let labels = load_labels(&cmd.labels, &cmd.model_dir)?;
    let queries = images_in(&cmd.queries)?;

    let pb = progress_bar(queries.len())?;
    let report = Evaluator::new(&model, &index, &labels, source)?
        .progress(pb.clone())
        .evaluate(&queries)?;
    pb.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("MAP Score: {:.4}", report.mean_ap);
        println!(
            "{} queries evaluated, {} scored 0 (no descriptors), {} skipped (no label)",
            report.evaluated, report.zero_scored, report.skipped
        );
    }
    Ok(())
}

fn query(cmd: &QueryCommand, source: &dyn DescriptorSource, json: bool) -> Result<()> {
    let model = load_model(&cmd.model_dir)?;
    let index = load_index(&cmd.model_dir)?;
    let labels = load_labels(&cmd.labels, &cmd.model_dir)?;
    let paths = match &cmd.corpus {
        Some(dir) => ImagePaths::scan(dir)?,
        None => ImagePaths::default(),
    };

    let evaluator = Evaluator::new(&model, &index, &labels, source)?;
    let result = match evaluator.query(&cmd.image) {
        Ok(result) => result,
        Err(e) => bail!("query {} failed: {}", cmd.image.display(), e),
    };
    let k = cmd.top.unwrap_or(model.params().top_k);
    let best = top_k(&result.ranking, k);

    if json {
        let hits: Vec<_> = best
            .iter()
            .map(|h| {
                serde_json::json!({
                    "id": h.id,
                    "score": h.score,
                    "label": labels.get(&h.id),
                    "path": paths.get(&h.id),
                })
            })
            .collect();
        let out = serde_json::json!({
            "query": result.id,
            "average_precision": result.average_precision,
            "failure": result.failure.as_ref().map(|e| e.to_string()),
            "hits": hits,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("MAP Score: {:.4}", result.average_precision);
        if let Some(e) = &result.failure {
            println!("Query could not be encoded: {}", e);
            return Ok(());
        }
        println!("Match      |      Score      |      Label");
        for h in best {
            let shown = paths
                .get(&h.id)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| h.id.clone());
            println!("{} | {:.4} | {}", shown, h.score, labels.get(&h.id).unwrap_or("?"));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    let source = make_source(&opts)?;
    match &opts.subcmd {
        SubCommand::Train(cmd) => train(cmd, source.as_ref()),
        SubCommand::Index(cmd) => index(cmd, source.as_ref(), opts.json),
        SubCommand::Eval(cmd) => eval(cmd, source.as_ref(), opts.json),
        SubCommand::Query(cmd) => query(cmd, source.as_ref(), opts.json),
    }
}
