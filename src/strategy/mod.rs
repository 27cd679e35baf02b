//! Classification strategies.
//!
//! A strategy maps an image to a class index of the active
//! [`SpeciesRegistry`](crate::species::SpeciesRegistry), or to
//! [`Verdict::Undetermined`] when it cannot tell. The engine routes
//! undetermined images, and every image whose classification failed, to the
//! registry's empty class.
//!
//! Built-in strategies:
//! - [`RandomStrategy`]: uniform over all classes
//! - [`RoundRobinStrategy`]: `cursor mod class count`, ignoring content
//! - [`Cascade`]: an object detector gating a fine-grained species classifier

mod cascade;
mod external;
mod registry;

pub use cascade::{Cascade, CascadeOptions, Detection, Detector, SpeciesClassifier};
pub use external::{CommandClassifier, CommandDetector};
pub use registry::{RegistryError, RegistryResult, StrategyBuilder, StrategyRegistry};

use crate::species::ClassIndex;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Name the random strategy is registered under.
pub const RANDOM: &str = "random";
/// Name the round-robin strategy is registered under.
pub const ROUND_ROBIN: &str = "round-robin";

/// Outcome of classifying one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Class(ClassIndex),
    /// No animal found, or no confident answer.
    Undetermined,
}

/// Per-call information a strategy may use besides the image itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyContext {
    /// Position of the image in the run's queue.
    pub cursor: usize,
    /// Size of the class index space.
    pub num_classes: usize,
    /// Model programs still running at this instant are killed.
    pub deadline: Option<Instant>,
}

/// Failures of a classification call.
///
/// None of these abort a run: the engine falls back to the empty class.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("model failure: {0}")]
    Model(String),
    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("unreadable output from {program}: {reason}")]
    InvalidOutput { program: String, reason: String },
    #[error("classifier returned {got} scores for {expected} classes")]
    ScoreShape { expected: usize, got: usize },
    #[error("classifier returned no finite score")]
    NoFiniteScore,
    #[error("class {index} is outside the {num_classes} known classes")]
    OutOfRange { index: usize, num_classes: usize },
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),
    #[error("classification worker exited without a result")]
    WorkerLost,
}

pub type ClassificationResult<T> = Result<T, ClassificationError>;

/// A pluggable way of resolving an image to a destination class.
///
/// Implementations are shared between threads and must not hold per-run
/// state that a hot-swap could tear.
pub trait ClassificationStrategy: Send + Sync {
    /// Name the strategy is registered under.
    fn name(&self) -> &str;

    fn classify(&self, image: &Path, ctx: &ClassifyContext) -> ClassificationResult<Verdict>;
}

/// Picks a class uniformly at random, ignoring the image.
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    /// Entropy-seeded random strategy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible random strategy.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassificationStrategy for RandomStrategy {
    fn name(&self) -> &str {
        RANDOM
    }

    fn classify(&self, _image: &Path, ctx: &ClassifyContext) -> ClassificationResult<Verdict> {
        if ctx.num_classes == 0 {
            return Err(ClassificationError::OutOfRange {
                index: 0,
                num_classes: 0,
            });
        }
        let index = self.rng.lock().gen_range(0..ctx.num_classes);
        Ok(Verdict::Class(ClassIndex(index)))
    }
}

/// Distributes images evenly: the n-th image goes to class `n mod count`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinStrategy;

impl ClassificationStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn classify(&self, _image: &Path, ctx: &ClassifyContext) -> ClassificationResult<Verdict> {
        if ctx.num_classes == 0 {
            return Err(ClassificationError::OutOfRange {
                index: ctx.cursor,
                num_classes: 0,
            });
        }
        Ok(Verdict::Class(ClassIndex(ctx.cursor % ctx.num_classes)))
    }
}
