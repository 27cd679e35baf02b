//! Detector and classifier backed by external programs.
//!
//! The models themselves live outside this crate. Each call runs the
//! configured program once and reads a single JSON document from its stdout:
//!
//! - detector: `{"detections": [{"label": "animal", "confidence": 0.93, "bbox": [x, y, w, h]}]}`
//! - classifier: `{"scores": [0.05, 0.81, 0.10, 0.04]}`
//!
//! Argument placeholders: `{image}`, `{weights}` and, for the classifier,
//! `{regions}` (the accepted detections as JSON).

use super::{ClassificationError, ClassificationResult, Detection, Detector, SpeciesClassifier};
use crate::config::CommandSpec;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct DetectorOutput {
    detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct ClassifierOutput {
    scores: Vec<f32>,
}

/// Interval between checks on a running model program.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs `spec` and parses its stdout as `T`.
///
/// With a deadline the program is polled and killed once the deadline
/// passes, so nothing outlives a timed-out classification.
fn run_json<T: DeserializeOwned>(
    spec: &CommandSpec,
    values: &[(&str, &str)],
    deadline: Option<Instant>,
) -> ClassificationResult<T> {
    let args = spec.render_args(values);
    debug!(program = %spec.program, ?args, "running model command");
    let started = Instant::now();

    let command_error = |source: io::Error| ClassificationError::Command {
        program: spec.program.clone(),
        source,
    };
    let handle = duct::cmd(&spec.program, &args)
        .stderr_null()
        .stdout_capture()
        .start()
        .map_err(command_error)?;

    let output = loop {
        if let Some(output) = handle.try_wait().map_err(command_error)? {
            break output;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            if let Err(e) = handle.kill() {
                warn!(program = %spec.program, error = %e, "failed to kill model command");
            }
            return Err(ClassificationError::Timeout(started.elapsed()));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).map_err(|e| ClassificationError::InvalidOutput {
        program: spec.program.clone(),
        reason: e.to_string(),
    })
}

fn path_arg(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Object detector run as an external program.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    spec: CommandSpec,
    weights: Option<PathBuf>,
}

impl CommandDetector {
    pub fn new(spec: CommandSpec, weights: Option<PathBuf>) -> Self {
        Self { spec, weights }
    }
}

impl Detector for CommandDetector {
    fn detect(
        &self,
        image: &Path,
        deadline: Option<Instant>,
    ) -> ClassificationResult<Vec<Detection>> {
        let image = image.to_string_lossy();
        let weights = path_arg(self.weights.as_deref());
        let values = [("image", &*image), ("weights", weights.as_str())];
        let output: DetectorOutput = run_json(&self.spec, &values, deadline)?;
        Ok(output.detections)
    }
}

/// Species classifier run as an external program.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    spec: CommandSpec,
    weights: Option<PathBuf>,
}

impl CommandClassifier {
    pub fn new(spec: CommandSpec, weights: Option<PathBuf>) -> Self {
        Self { spec, weights }
    }

    pub fn weights(&self) -> Option<&Path> {
        self.weights.as_deref()
    }
}

impl SpeciesClassifier for CommandClassifier {
    fn score(
        &self,
        image: &Path,
        regions: &[Detection],
        deadline: Option<Instant>,
    ) -> ClassificationResult<Vec<f32>> {
        let image = image.to_string_lossy();
        let weights = path_arg(self.weights.as_deref());
        let regions = serde_json::to_string(regions)
            .map_err(|e| ClassificationError::Model(format!("cannot encode regions: {}", e)))?;
        let values = [
            ("image", &*image),
            ("weights", weights.as_str()),
            ("regions", regions.as_str()),
        ];
        let output: ClassifierOutput = run_json(&self.spec, &values, deadline)?;
        Ok(output.scores)
    }
}
