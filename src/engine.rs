//! The distribution engine.
//!
//! A run ("session") moves every image of a queue into the class folder chosen
//! for it, one image per step. Steps are driven either by [`tick`] (automatic
//! mode) or by [`manual_step`] (manual mode, the operator picks the folder).
//!
//! ```text
//! Idle ──start──► Running(Auto) ◄──resume── Paused
//!   │                  │   └──────pause──────►  │
//!   │                  ├──stop──► Stopped ◄──stop┘
//!   │                  └──last image──► Completed
//!   └──start(manual)──► Running(Manual) ──stop / last image──► Stopped / Completed
//! ```
//!
//! Per-image failures never end a run: a failed classification sends the
//! image to the empty class, a failed move skips the image. Either way the
//! cursor advances, so the same image is never attempted twice.
//!
//! [`tick`]: DistributionEngine::tick
//! [`manual_step`]: DistributionEngine::manual_step

use crate::config::TrapsortConfig;
use crate::file_organizer::{FileOrganizer, MoveRecord};
use crate::inventory::{FolderInventory, ImageQueueEntry, InventoryError, InventorySnapshot};
use crate::species::{ClassIndex, SpeciesRegistry};
use crate::strategy::{
    ClassificationError, ClassificationResult, ClassificationStrategy, ClassifyContext,
    RegistryError, StrategyRegistry, Verdict,
};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default bound on a single classification call.
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// How steps of a run are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Ticks move images as fast as the scheduler allows.
    Auto,
    /// Only explicit per-image commands move images.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running(RunMode),
    Paused,
    Stopped,
    Completed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Completed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running(_) | EngineState::Paused)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No images found in {}", .0.display())]
    EmptySource(PathBuf),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("No run in progress")]
    NotRunning,
    #[error("The current run is not in manual mode")]
    NotManual,
    #[error("The current run is in manual mode")]
    ManualMode,
    #[error("Unknown destination folder '{0}'")]
    UnknownFolder(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Final report of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub root: PathBuf,
    pub strategy: String,
    pub mode: RunMode,
    pub total: usize,
    /// Images moved into a class folder.
    pub moved: usize,
    /// Images sent to the empty class because classification failed.
    pub fallbacks: usize,
    /// Images left in place because the move failed.
    pub failures: usize,
    pub snapshot: InventorySnapshot,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Moved {
        record: MoveRecord,
        /// True when classification failed and the empty class was used.
        fallback: bool,
    },
    Skipped {
        image: PathBuf,
        reason: String,
    },
}

/// Observable state transitions of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started {
        root: PathBuf,
        strategy: String,
        mode: RunMode,
        total: usize,
    },
    /// Classification failed; the image goes to the empty class.
    Warning {
        index: usize,
        image: PathBuf,
        message: String,
    },
    Stepped {
        index: usize,
        outcome: StepOutcome,
        snapshot: InventorySnapshot,
    },
    Paused,
    Resumed,
    Stopped {
        cursor: usize,
        total: usize,
    },
    Completed(RunSummary),
}

/// Receives engine events.
pub trait EventSink {
    fn on_event(&mut self, event: &EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _event: &EngineEvent) {}
}

/// Mutable state of one run.
pub struct Session {
    root: PathBuf,
    queue: Vec<ImageQueueEntry>,
    cursor: usize,
    paused: bool,
    stopped: bool,
    mode: RunMode,
    strategy: Arc<dyn ClassificationStrategy>,
    strategy_name: String,
    started_at: DateTime<Local>,
    moved: usize,
    fallbacks: usize,
    failures: usize,
}

impl Session {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> &[ImageQueueEntry] {
        &self.queue
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    fn is_finished(&self) -> bool {
        self.cursor >= self.queue.len()
    }

    fn current(&self) -> Option<&ImageQueueEntry> {
        self.queue.get(self.cursor)
    }
}

/// Drives sorting runs. Every command takes `&mut self`, so a session is only
/// ever mutated by one caller at a time.
pub struct DistributionEngine {
    species: SpeciesRegistry,
    registry: Arc<StrategyRegistry>,
    inventory: FolderInventory,
    recursive: bool,
    classify_timeout: Duration,
    sink: Box<dyn EventSink>,
    state: EngineState,
    session: Option<Session>,
    snapshot: InventorySnapshot,
    summary: Option<RunSummary>,
}

impl DistributionEngine {
    pub fn new(
        species: SpeciesRegistry,
        registry: Arc<StrategyRegistry>,
        inventory: FolderInventory,
    ) -> Self {
        Self {
            species,
            registry,
            inventory,
            recursive: false,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            sink: Box::new(NullSink),
            state: EngineState::Idle,
            session: None,
            snapshot: InventorySnapshot::default(),
            summary: None,
        }
    }

    /// Engine set up from the `[species]`, `[scan]` and `[engine]` sections.
    pub fn from_config(
        config: &TrapsortConfig,
        registry: Arc<StrategyRegistry>,
    ) -> Result<Self, crate::config::ConfigError> {
        let species = config.species_registry()?;
        let inventory = FolderInventory::new(config.scan.compile()?);
        Ok(Self::new(species, registry, inventory)
            .with_recursive(config.scan.recursive)
            .with_classify_timeout(config.engine.classify_timeout()))
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = sink;
    }

    pub fn species(&self) -> &SpeciesRegistry {
        &self.species
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Index of the next image to move; 0 without a session.
    pub fn cursor(&self) -> usize {
        self.session.as_ref().map_or(0, Session::cursor)
    }

    /// Number of images queued in the current session.
    pub fn image_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.queue.len())
    }

    /// Latest per-class counts.
    pub fn per_class_counts(&self) -> &InventorySnapshot {
        &self.snapshot
    }

    /// The image awaiting a decision, while a run is active.
    pub fn current_image(&self) -> Option<&Path> {
        if !self.state.is_active() {
            return None;
        }
        self.session
            .as_ref()
            .and_then(Session::current)
            .map(|entry| entry.source_path.as_path())
    }

    /// Summary of the last completed run.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Starts a new session over the images in `root`.
    ///
    /// Any previous session is discarded. On error the engine is left `Idle`
    /// and nothing on disk has been moved.
    pub fn start(
        &mut self,
        root: &Path,
        strategy_name: &str,
        manual_mode: bool,
    ) -> EngineResult<()> {
        self.state = EngineState::Idle;
        self.session = None;
        self.summary = None;

        if root.as_os_str().is_empty() {
            return Err(EngineError::EmptySource(root.to_path_buf()));
        }

        let strategy = self.registry.get(strategy_name)?;
        let queue = self.inventory.build_queue(root, self.recursive, &self.species)?;
        if queue.is_empty() {
            return Err(EngineError::EmptySource(root.to_path_buf()));
        }
        self.inventory.ensure_destination_folders(root, &self.species)?;

        let mode = if manual_mode {
            RunMode::Manual
        } else {
            RunMode::Auto
        };
        let total = queue.len();
        self.session = Some(Session {
            root: root.to_path_buf(),
            queue,
            cursor: 0,
            paused: false,
            stopped: false,
            mode,
            strategy,
            strategy_name: strategy_name.to_string(),
            started_at: Local::now(),
            moved: 0,
            fallbacks: 0,
            failures: 0,
        });
        self.state = EngineState::Running(mode);
        self.snapshot = self.inventory.snapshot(root, &self.species);

        info!(root = %root.display(), strategy = strategy_name, ?mode, total, "run started");
        self.emit(EngineEvent::Started {
            root: root.to_path_buf(),
            strategy: strategy_name.to_string(),
            mode,
            total,
        });
        Ok(())
    }

    /// Automatic step. Inert unless a run is `Running(Auto)`.
    pub fn tick(&mut self) -> Option<StepOutcome> {
        if self.state != EngineState::Running(RunMode::Auto) {
            return None;
        }
        self.move_one().ok()
    }

    /// Classifies the image at the cursor and moves it.
    pub fn move_one(&mut self) -> EngineResult<StepOutcome> {
        match self.state {
            EngineState::Running(RunMode::Auto) => {}
            EngineState::Running(RunMode::Manual) => return Err(EngineError::ManualMode),
            _ => return Err(EngineError::NotRunning),
        }
        Ok(self.step(None))
    }

    /// Moves the image at the cursor into `folder`, chosen by the operator.
    pub fn manual_step(&mut self, folder: &str) -> EngineResult<StepOutcome> {
        match self.state {
            EngineState::Running(RunMode::Manual) => {}
            EngineState::Running(RunMode::Auto) | EngineState::Paused => {
                return Err(EngineError::NotManual);
            }
            _ => return Err(EngineError::NotRunning),
        }
        let class = self
            .species
            .by_folder(folder)
            .map(|class| class.index)
            .ok_or_else(|| EngineError::UnknownFolder(folder.to_string()))?;
        Ok(self.step(Some(class)))
    }

    /// Suspends an automatic run. Returns whether the state changed.
    pub fn pause(&mut self) -> bool {
        if self.state != EngineState::Running(RunMode::Auto) {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.paused = true;
        }
        self.state = EngineState::Paused;
        info!("run paused");
        self.emit(EngineEvent::Paused);
        true
    }

    /// Continues a paused run. Returns whether the state changed.
    pub fn resume(&mut self) -> bool {
        if self.state != EngineState::Paused {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.paused = false;
        }
        self.state = EngineState::Running(RunMode::Auto);
        info!("run resumed");
        self.emit(EngineEvent::Resumed);
        true
    }

    /// Pauses a running run or resumes a paused one.
    pub fn toggle_pause(&mut self) -> bool {
        match self.state {
            EngineState::Paused => self.resume(),
            _ => self.pause(),
        }
    }

    /// Ends the session early. Moves already made stay in place.
    ///
    /// Idempotent; only the first call on an active run emits `Stopped`.
    pub fn stop(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stopped = true;
        if !self.state.is_active() {
            return;
        }
        let (cursor, total) = (session.cursor, session.queue.len());
        self.state = EngineState::Stopped;
        info!(cursor, total, "run stopped");
        self.emit(EngineEvent::Stopped { cursor, total });
    }

    /// One step over the image at the cursor. Callers have checked the state.
    fn step(&mut self, chosen: Option<ClassIndex>) -> StepOutcome {
        let Some(session) = self.session.as_ref() else {
            return StepOutcome::Skipped {
                image: PathBuf::new(),
                reason: EngineError::NotRunning.to_string(),
            };
        };
        let index = session.cursor;
        let root = session.root.clone();
        let image = session.queue[index].source_path.clone();
        let strategy = Arc::clone(&session.strategy);

        let (class, fallback) = match chosen {
            Some(class) => (class, false),
            None => self.resolve(strategy, &image, index),
        };
        let folder = self
            .species
            .folder_name(class)
            .unwrap_or(self.species.empty().folder_name.as_str())
            .to_string();

        let outcome = match FileOrganizer::move_into_class(&root, &image, &folder) {
            Ok(record) => StepOutcome::Moved { record, fallback },
            Err(e) => {
                warn!(image = %image.display(), error = %e, "skipping image");
                StepOutcome::Skipped {
                    image: image.clone(),
                    reason: e.to_string(),
                }
            }
        };

        if let Some(session) = self.session.as_mut() {
            session.cursor += 1;
            match &outcome {
                StepOutcome::Moved { fallback, .. } => {
                    session.moved += 1;
                    if *fallback {
                        session.fallbacks += 1;
                    }
                }
                StepOutcome::Skipped { .. } => session.failures += 1,
            }
        }

        self.snapshot = self.inventory.snapshot(&root, &self.species);
        self.emit(EngineEvent::Stepped {
            index,
            outcome: outcome.clone(),
            snapshot: self.snapshot.clone(),
        });

        if self.session.as_ref().is_some_and(Session::is_finished) {
            self.complete();
        }
        outcome
    }

    /// Maps the strategy's answer to a class, falling back to the empty class.
    fn resolve(
        &mut self,
        strategy: Arc<dyn ClassificationStrategy>,
        image: &Path,
        index: usize,
    ) -> (ClassIndex, bool) {
        let ctx = ClassifyContext {
            cursor: index,
            num_classes: self.species.len(),
            deadline: Some(Instant::now() + self.classify_timeout),
        };
        let result = classify_with_deadline(strategy, image, ctx, self.classify_timeout)
            .and_then(|verdict| match verdict {
                Verdict::Class(class) if class.0 < ctx.num_classes => Ok(Some(class)),
                Verdict::Class(class) => Err(ClassificationError::OutOfRange {
                    index: class.0,
                    num_classes: ctx.num_classes,
                }),
                Verdict::Undetermined => Ok(None),
            });

        match result {
            Ok(Some(class)) => (class, false),
            Ok(None) => {
                debug!(image = %image.display(), "undetermined, using empty class");
                (self.species.empty_index(), false)
            }
            Err(e) => {
                warn!(
                    image = %image.display(),
                    error = %e,
                    "classification failed, using empty class"
                );
                self.emit(EngineEvent::Warning {
                    index,
                    image: image.to_path_buf(),
                    message: e.to_string(),
                });
                (self.species.empty_index(), true)
            }
        }
    }

    fn complete(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let summary = RunSummary {
            root: session.root.clone(),
            strategy: session.strategy_name.clone(),
            mode: session.mode,
            total: session.queue.len(),
            moved: session.moved,
            fallbacks: session.fallbacks,
            failures: session.failures,
            snapshot: self.snapshot.clone(),
            started_at: session.started_at,
            finished_at: Local::now(),
        };
        self.state = EngineState::Completed;
        info!(
            total = summary.total,
            moved = summary.moved,
            fallbacks = summary.fallbacks,
            failures = summary.failures,
            "run completed"
        );
        self.summary = Some(summary.clone());
        self.emit(EngineEvent::Completed(summary));
    }

    fn emit(&mut self, event: EngineEvent) {
        self.sink.on_event(&event);
    }
}

/// Runs one classification on a worker thread, bounded by `timeout`.
///
/// The same deadline travels in `ctx`, so model programs are killed when it
/// passes. A strategy that ignores it is abandoned: the worker keeps its own
/// `Arc` of the strategy and its result is dropped.
fn classify_with_deadline(
    strategy: Arc<dyn ClassificationStrategy>,
    image: &Path,
    ctx: ClassifyContext,
    timeout: Duration,
) -> ClassificationResult<Verdict> {
    let deadline = ctx.deadline.unwrap_or_else(|| Instant::now() + timeout);
    let (tx, rx) = flume::bounded(1);
    let image = image.to_path_buf();
    thread::Builder::new()
        .name("trapsort-classify".to_string())
        .spawn(move || {
            let _ = tx.send(strategy.classify(&image, &ctx));
        })
        .map_err(|e| ClassificationError::Model(format!("cannot start worker: {}", e)))?;

    match rx.recv_deadline(deadline) {
        Ok(result) => result,
        Err(flume::RecvTimeoutError::Timeout) => Err(ClassificationError::Timeout(timeout)),
        Err(flume::RecvTimeoutError::Disconnected) => Err(ClassificationError::WorkerLost),
    }
}
