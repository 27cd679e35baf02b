//! Two-stage detector → classifier pipeline.

use super::{
    ClassificationError, ClassificationResult, ClassificationStrategy, ClassifyContext, Verdict,
};
use crate::species::ClassIndex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

/// One region reported by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in image pixels.
    #[serde(default)]
    pub bbox: [f32; 4],
}

/// General-purpose object localizer (stage 1).
///
/// Implementations still busy at `deadline` give up with
/// [`ClassificationError::Timeout`].
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        image: &Path,
        deadline: Option<Instant>,
    ) -> ClassificationResult<Vec<Detection>>;
}

/// Fine-grained species scorer (stage 2).
///
/// Returns one score per class, indexed by class index.
pub trait SpeciesClassifier: Send + Sync {
    fn score(
        &self,
        image: &Path,
        regions: &[Detection],
        deadline: Option<Instant>,
    ) -> ClassificationResult<Vec<f32>>;
}

/// Which detections count as an animal.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeOptions {
    /// Accepted labels, case-insensitive. Empty accepts every label.
    pub target_labels: Vec<String>,
    pub min_confidence: f32,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            target_labels: vec!["animal".to_string()],
            min_confidence: 0.2,
        }
    }
}

impl CascadeOptions {
    fn accepts(&self, detection: &Detection) -> bool {
        detection.confidence >= self.min_confidence
            && (self.target_labels.is_empty()
                || self
                    .target_labels
                    .iter()
                    .any(|label| label.eq_ignore_ascii_case(&detection.label)))
    }
}

/// Detector gating a species classifier.
///
/// Frames without an accepted detection are [`Verdict::Undetermined`] and the
/// classifier is never called for them.
pub struct Cascade {
    name: String,
    detector: Box<dyn Detector>,
    classifier: Box<dyn SpeciesClassifier>,
    options: CascadeOptions,
}

impl Cascade {
    pub fn new(
        name: impl Into<String>,
        detector: Box<dyn Detector>,
        classifier: Box<dyn SpeciesClassifier>,
        options: CascadeOptions,
    ) -> Self {
        Self {
            name: name.into(),
            detector,
            classifier,
            options,
        }
    }
}

impl ClassificationStrategy for Cascade {
    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, image: &Path, ctx: &ClassifyContext) -> ClassificationResult<Verdict> {
        let regions: Vec<Detection> = self
            .detector
            .detect(image, ctx.deadline)?
            .into_iter()
            .filter(|detection| self.options.accepts(detection))
            .collect();

        if regions.is_empty() {
            debug!(image = %image.display(), "no animal detected");
            return Ok(Verdict::Undetermined);
        }

        let scores = self.classifier.score(image, &regions, ctx.deadline)?;
        if scores.len() != ctx.num_classes {
            return Err(ClassificationError::ScoreShape {
                expected: ctx.num_classes,
                got: scores.len(),
            });
        }
        arg_max(&scores)
            .map(|index| Verdict::Class(ClassIndex(index)))
            .ok_or(ClassificationError::NoFiniteScore)
    }
}

/// Index of the highest finite score; the first one wins ties.
fn arg_max(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if !score.is_finite() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}
