//! Pretrained MobileNet image classifier.
//!
//! The network is an opaque ONNX artifact. This module only prepares its input,
//! runs it with `tract` and turns the raw scores into ranked predictions.
use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use common::protocol::Prediction;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::utils::ensure_file;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 224;

/// ImageNet class names, one synset per line.
pub const LABELS_FILE: &str = "synset.txt";

const LABELS_URL: &str =
    "https://raw.githubusercontent.com/onnx/models/main/validated/vision/classification/synset.txt";

const MOBILENET_V2_100_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-7.onnx";

/// Maps an RGB frame to ranked label/confidence rows.
pub trait InferModel: Send + Sync {
    fn classify(&self, image: &RgbImage) -> Result<Vec<Prediction>>;
}

/// MobileNet variant to load.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelConfig {
    pub version: u8,
    pub alpha: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            version: 2,
            alpha: 1.0,
        }
    }
}

impl ModelConfig {
    /// Check that the variant exists.
    pub fn validate(&self) -> Result<()> {
        let alphas: &[f32] = match self.version {
            1 => &[0.25, 0.5, 0.75, 1.0],
            2 => &[0.5, 0.75, 1.0],
            version => bail!("unsupported MobileNet version {version}"),
        };

        if !alphas.iter().any(|alpha| (alpha - self.alpha).abs() < f32::EPSILON) {
            bail!(
                "MobileNet v{} does not support alpha {}, use one of {:?}",
                self.version,
                self.alpha,
                alphas
            );
        }

        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("mobilenet_v{}_{:.2}.onnx", self.version, self.alpha)
    }

    /// Where to fetch the model from when it is not on disk yet.
    pub fn download_url(&self) -> Option<&'static str> {
        match (self.version, self.alpha) {
            (2, alpha) if (alpha - 1.0).abs() < f32::EPSILON => Some(MOBILENET_V2_100_URL),
            _ => None,
        }
    }
}

/// MobileNet classifier on `tract`.
pub struct MobileNetModel {
    model: NnModel,
    labels: Vec<String>,
    top_k: usize,
}

impl MobileNetModel {
    /// Load the model, fetching the model and label files into `model_dir` if needed.
    pub async fn load(config: ModelConfig, model_dir: &Path, top_k: usize) -> Result<Self> {
        config.validate()?;

        let model_path = model_dir.join(config.file_name());
        let labels_path = model_dir.join(LABELS_FILE);
        ensure_file(&model_path, config.download_url()).await?;
        ensure_file(&labels_path, Some(LABELS_URL)).await?;

        let instance = tokio::task::spawn_blocking(move || {
            MobileNetModel::from_files(&model_path, &labels_path, top_k)
        })
        .await??;
        log::info!(
            "Loaded MobileNet v{} alpha {} with {} labels",
            config.version,
            config.alpha,
            instance.labels.len()
        );

        Ok(instance)
    }

    /// Build the classifier from files that are already on disk.
    pub fn from_files(model_path: &Path, labels_path: &Path, top_k: usize) -> Result<Self> {
        let labels = std::fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read {}", labels_path.display()))?;
        let labels = parse_labels(&labels);
        if labels.is_empty() {
            bail!("no labels in {}", labels_path.display());
        }

        let model = get_mobilenet_model(model_path.to_owned())?;

        Ok(Self {
            model,
            labels,
            top_k,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            INPUT_SIZE,
            INPUT_SIZE,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
            |(_, c, y, x)| {
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }
}

impl InferModel for MobileNetModel {
    fn classify(&self, image: &RgbImage) -> Result<Vec<Prediction>> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(image).into()))?;
        let scores: Vec<f32> = raw_nn_out[0].to_array_view::<f32>()?.iter().copied().collect();

        rank(&to_probabilities(scores), &self.labels, self.top_k)
    }
}

fn get_mobilenet_model(filename: PathBuf) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(&filename)
        .with_context(|| format!("failed to read model {}", filename.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Parse a label file.
///
/// Lines may be prefixed with a WordNet id (`n01440764 tench, Tinca tinca`), which is dropped.
pub fn parse_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((wnid, name)) if is_wnid(wnid) => name.trim().to_owned(),
            _ => line.to_owned(),
        })
        .collect()
}

fn is_wnid(token: &str) -> bool {
    token.len() > 1
        && token.starts_with('n')
        && token[1..].chars().all(|c| c.is_ascii_digit())
}

/// Turn raw network scores into probabilities.
///
/// Scores that already form a distribution are returned untouched, logits go
/// through a softmax.
pub fn to_probabilities(mut scores: Vec<f32>) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let is_distribution = scores.iter().all(|x| (0.0..=1.0).contains(x)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return scores;
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0;
    for score in scores.iter_mut() {
        *score = (*score - max).exp();
        total += *score;
    }
    for score in scores.iter_mut() {
        *score /= total;
    }

    scores
}

/// Pick the `top_k` most confident labels, ranked by descending confidence.
///
/// A leading background class is skipped when there is one score more than labels.
pub fn rank(probabilities: &[f32], labels: &[String], top_k: usize) -> Result<Vec<Prediction>> {
    let probabilities = match probabilities.len() {
        n if n == labels.len() => probabilities,
        n if n == labels.len() + 1 => &probabilities[1..],
        n => bail!("model has {} outputs but there are {} labels", n, labels.len()),
    };

    let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    Ok(ranked
        .into_iter()
        .take(top_k)
        .map(|(index, confidence)| Prediction::new(labels[index].clone(), confidence))
        .collect())
}
