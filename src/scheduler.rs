//! Single-consumer command loop around the engine.
//!
//! Operator commands arrive on a `flume` channel from any number of threads
//! (stdin reader, UI, timers). The scheduler is the only code that touches
//! the engine while a run is in progress: it drains pending commands, then
//! ticks once, and repeats.

use crate::engine::{DistributionEngine, EngineState, RunMode, RunSummary};
use flume::{Receiver, TryRecvError};
use tracing::{debug, warn};

/// Operator requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    /// Pause when running, resume when paused.
    TogglePause,
    Stop,
    /// Move the current image into the named folder (manual mode).
    ManualStep(String),
    /// One automatic step. Redundant in auto mode, inert in manual mode.
    Tick,
}

/// How a scheduled run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Stopped { cursor: usize, total: usize },
    /// No run was started.
    Idle,
}

pub struct Scheduler;

impl Scheduler {
    /// Drives `engine` until its run completes or stops.
    ///
    /// In auto mode the engine is ticked continuously and a closed channel is
    /// ignored. While paused or in manual mode the loop blocks on the next
    /// command; a closed channel then stops the run, since nothing could ever
    /// move it forward again.
    pub fn run(engine: &mut DistributionEngine, commands: &Receiver<Command>) -> RunOutcome {
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => Self::apply(engine, command),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }

            match engine.state() {
                EngineState::Idle => return RunOutcome::Idle,
                EngineState::Completed => {
                    return match engine.summary() {
                        Some(summary) => RunOutcome::Completed(summary.clone()),
                        None => RunOutcome::Idle,
                    };
                }
                EngineState::Stopped => {
                    return RunOutcome::Stopped {
                        cursor: engine.cursor(),
                        total: engine.image_count(),
                    };
                }
                EngineState::Running(RunMode::Auto) => {
                    engine.tick();
                }
                EngineState::Running(RunMode::Manual) | EngineState::Paused => {
                    match commands.recv() {
                        Ok(command) => Self::apply(engine, command),
                        Err(_) => {
                            debug!("command channel closed, stopping");
                            engine.stop();
                        }
                    }
                }
            }
        }
    }

    fn apply(engine: &mut DistributionEngine, command: Command) {
        debug!(?command, "applying command");
        match command {
            Command::Pause => {
                engine.pause();
            }
            Command::Resume => {
                engine.resume();
            }
            Command::TogglePause => {
                engine.toggle_pause();
            }
            Command::Stop => engine.stop(),
            Command::ManualStep(folder) => {
                if let Err(e) = engine.manual_step(&folder) {
                    warn!(folder = %folder, error = %e, "manual step rejected");
                }
            }
            Command::Tick => {
                engine.tick();
            }
        }
    }
}
