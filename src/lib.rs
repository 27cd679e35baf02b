//! trapsort - sorting camera-trap images into species folders
//!
//! This library scans a folder of camera-trap images, resolves each image to
//! a species class (randomly, round-robin, through a detector + classifier
//! cascade, or by hand) and moves it into the matching subfolder. Model
//! families can be retrained from curated folders and hot-swapped while the
//! process runs.

pub mod cli;
pub mod config;
pub mod engine;
pub mod file_organizer;
pub mod inventory;
pub mod logging;
pub mod output;
pub mod scheduler;
pub mod species;
pub mod strategy;
pub mod training;

pub use config::{ConfigError, ModelFamily, TrapsortConfig};
pub use engine::{
    DistributionEngine, EngineError, EngineEvent, EngineState, EventSink, RunMode, RunSummary,
    StepOutcome,
};
pub use file_organizer::{FileOrganizer, MoveError, MoveRecord};
pub use inventory::{FolderInventory, ImageQueueEntry, InventoryError, InventorySnapshot};
pub use scheduler::{Command, RunOutcome, Scheduler};
pub use species::{ClassIndex, SpeciesClass, SpeciesRegistry};
pub use strategy::{ClassificationError, ClassificationStrategy, StrategyRegistry, Verdict};
pub use training::{
    CommandTrainer, Trainer, TrainingError, TrainingJob, TrainingOrchestrator, WeightsHandle,
};
