//! Command-line interface for trapsort.
//!
//! Each subcommand loads the configuration, builds the pieces it needs and
//! reports through [`OutputFormatter`]. Long-running sorts are driven by the
//! [`Scheduler`]; a background thread turns stdin lines into commands.

use crate::config::{ConfigError, ModelFamily, TrapsortConfig};
use crate::engine::{DistributionEngine, EngineError, EngineState, RunMode};
use crate::inventory::{FolderInventory, InventoryError};
use crate::output::{ConsoleSink, OutputFormatter};
use crate::scheduler::{Command, RunOutcome, Scheduler};
use crate::strategy::{RegistryError, StrategyRegistry};
use crate::training::{
    CommandTrainer, TrainingError, TrainingJob, TrainingOrchestrator, WeightsHandle,
};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::Select;
use dialoguer::theme::ColorfulTheme;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "trapsort", version, about = "Sort camera-trap images into species folders")]
pub struct Cli {
    /// Configuration file (defaults to .trapsortrc.toml, then ~/.config/trapsort/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level diagnostics
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Classify and move every image under ROOT
    Sort {
        root: PathBuf,
        /// Strategy name (see `trapsort strategies`)
        #[arg(short, long)]
        strategy: Option<String>,
        /// Include images in subfolders
        #[arg(short, long)]
        recursive: bool,
        /// Weights for the strategy's model family
        #[arg(long)]
        weights: Option<PathBuf>,
    },
    /// Label the images under ROOT one by one
    Manual {
        root: PathBuf,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Show how many images each class folder holds
    Counts { root: PathBuf },
    /// Retrain a model family from curated class folders
    Train {
        #[arg(long, value_parser = parse_family)]
        family: ModelFamily,
        #[arg(long, default_value_t = 10)]
        epochs: u32,
        /// Directory holding one subfolder per class
        #[arg(long)]
        data: PathBuf,
    },
    /// List the available strategies
    Strategies,
}

fn parse_family(name: &str) -> Result<ModelFamily, String> {
    ModelFamily::from_name(name).ok_or_else(|| {
        let known: Vec<_> = ModelFamily::ALL.iter().map(|f| f.strategy_name()).collect();
        format!("unknown model family '{}' (expected one of: {})", name, known.join(", "))
    })
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error("Prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CliResult<T> = Result<T, CliError>;

/// Runs one parsed command line.
pub fn run(cli: Cli) -> CliResult<()> {
    let config = TrapsortConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Sort {
            root,
            strategy,
            recursive,
            weights,
        } => sort(&config, &root, strategy.as_deref(), recursive, weights.as_deref()),
        Commands::Manual { root, recursive } => manual(&config, &root, recursive),
        Commands::Counts { root } => counts(&config, &root),
        Commands::Train {
            family,
            epochs,
            data,
        } => train(&config, family, epochs, &data),
        Commands::Strategies => strategies(&config),
    }
}

fn build_engine(
    config: &TrapsortConfig,
    recursive: bool,
) -> CliResult<(DistributionEngine, Arc<StrategyRegistry>)> {
    let registry = Arc::new(StrategyRegistry::from_config(config)?);
    let engine = DistributionEngine::from_config(config, Arc::clone(&registry))?
        .with_recursive(recursive || config.scan.recursive)
        .with_sink(Box::new(ConsoleSink::new()));
    Ok((engine, registry))
}

fn sort(
    config: &TrapsortConfig,
    root: &Path,
    strategy: Option<&str>,
    recursive: bool,
    weights: Option<&Path>,
) -> CliResult<()> {
    let (mut engine, registry) = build_engine(config, recursive)?;
    let strategy = strategy.unwrap_or(config.engine.default_strategy.as_str());

    if let Some(path) = weights {
        let family = ModelFamily::from_name(strategy)
            .ok_or_else(|| RegistryError::Build(format!("'{}' does not take weights", strategy)))?;
        registry.reload(
            family,
            &WeightsHandle {
                family,
                path: path.to_path_buf(),
            },
        )?;
    }

    engine.start(root, strategy, false)?;
    OutputFormatter::plain(&format!(
        "{}",
        "Type p to pause, r to resume, s to stop (then Enter)".dimmed()
    ));

    let (tx, rx) = flume::unbounded();
    thread::Builder::new()
        .name("trapsort-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines().map_while(Result::ok) {
                let command = match line.trim() {
                    "p" | "pause" => Command::Pause,
                    "r" | "resume" => Command::Resume,
                    "s" | "stop" | "q" => Command::Stop,
                    _ => continue,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        })?;

    let outcome = Scheduler::run(&mut engine, &rx);
    if let RunOutcome::Stopped { cursor, .. } = outcome {
        debug!(cursor, "sort stopped by operator");
    }
    Ok(())
}

const STOP_ENTRY: &str = "[stop]";

fn manual(config: &TrapsortConfig, root: &Path, recursive: bool) -> CliResult<()> {
    let (mut engine, _registry) = build_engine(config, recursive)?;
    engine.start(root, &config.engine.default_strategy, true)?;

    let mut items: Vec<String> = engine.species().folder_names().map(str::to_string).collect();
    items.push(STOP_ENTRY.to_string());
    let theme = ColorfulTheme::default();

    while engine.state() == EngineState::Running(RunMode::Manual) {
        let Some(image) = engine.current_image().map(Path::to_path_buf) else {
            break;
        };
        let prompt = format!(
            "[{}/{}] {}",
            engine.cursor() + 1,
            engine.image_count(),
            image.display()
        );
        let choice = Select::with_theme(&theme)
            .with_prompt(prompt)
            .items(&items)
            .default(0)
            .interact_opt()?;

        match choice.map(|index| items[index].as_str()) {
            None | Some(STOP_ENTRY) => engine.stop(),
            Some(folder) => {
                engine.manual_step(folder)?;
            }
        }
    }
    debug!(state = ?engine.state(), "manual session ended");
    Ok(())
}

fn counts(config: &TrapsortConfig, root: &Path) -> CliResult<()> {
    let species = config.species_registry()?;
    let inventory = FolderInventory::new(config.scan.compile()?);
    let queue = inventory.build_queue(root, config.scan.recursive, &species)?;

    OutputFormatter::info(&format!("{} images waiting in {}", queue.len(), root.display()));
    OutputFormatter::counts_table(&inventory.snapshot(root, &species));
    Ok(())
}

fn train(config: &TrapsortConfig, family: ModelFamily, epochs: u32, data: &Path) -> CliResult<()> {
    let registry = Arc::new(StrategyRegistry::from_config(config)?);
    let trainer = CommandTrainer::from_config(config, family)?;
    let job = TrainingJob::from_data_dir(family, epochs, data, &config.species_registry()?);
    let orchestrator = TrainingOrchestrator::new(Box::new(trainer), registry);

    OutputFormatter::info(&format!("Training {} for {} epochs", family, epochs));
    let handle = orchestrator.train_and_reload(&job, &mut |line: &str| {
        println!("  {}", line.dimmed());
    })?;

    OutputFormatter::success(&format!("Weights written to {}", handle.path.display()));
    OutputFormatter::plain(&format!(
        "Set `weights` under [models.{}] to use them by default.",
        family
    ));
    Ok(())
}

fn strategies(config: &TrapsortConfig) -> CliResult<()> {
    let registry = StrategyRegistry::from_config(config)?;
    OutputFormatter::header("STRATEGIES");
    for name in registry.names() {
        if name == config.engine.default_strategy {
            OutputFormatter::plain(&format!("{} {}", name.bold(), "(default)".dimmed()));
        } else {
            OutputFormatter::plain(&name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_sort_command() {
        let cli = Cli::try_parse_from([
            "trapsort",
            "--verbose",
            "sort",
            "/traps/cam1",
            "--strategy",
            "random",
            "-r",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Sort {
                root,
                strategy,
                recursive,
                weights,
            } => {
                assert_eq!(root, PathBuf::from("/traps/cam1"));
                assert_eq!(strategy.as_deref(), Some("random"));
                assert!(recursive);
                assert!(weights.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parses_train_family() {
        let cli = Cli::try_parse_from([
            "trapsort",
            "train",
            "--family",
            "efficientnet-b0",
            "--epochs",
            "3",
            "--data",
            "curated",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Train {
                family: ModelFamily::EfficientNetB0,
                epochs: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_family() {
        assert!(
            Cli::try_parse_from(["trapsort", "train", "--family", "vgg", "--data", "x"]).is_err()
        );
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["trapsort", "counts", "/traps", "--config", "custom.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
    }
}
