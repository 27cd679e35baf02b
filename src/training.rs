//! Retraining a model family from operator-curated folders.
//!
//! A [`TrainingJob`] names one source folder per class. The [`Trainer`]
//! produces a weights artifact, and [`TrainingOrchestrator::train_and_reload`]
//! swaps the family's strategy over to it. If any stage fails, the
//! previously active weights stay in force.

use crate::config::{CommandSpec, ModelFamily, TrapsortConfig};
use crate::inventory::FolderInventory;
use crate::species::SpeciesRegistry;
use crate::strategy::{RegistryError, StrategyRegistry};
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Artifact produced by a successful training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsHandle {
    pub family: ModelFamily,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Invalid training job: {0}")]
    InvalidJob(String),
    #[error("No trainer configured for '{0}'")]
    NoTrainer(ModelFamily),
    #[error("Failed to prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to run trainer {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Trainer {program} failed: {status}")]
    Failed { program: String, status: String },
    #[error("Trainer finished without writing {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type TrainingResult<T> = Result<T, TrainingError>;

/// One retraining request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingJob {
    pub family: ModelFamily,
    pub epochs: u32,
    /// Class folder name → folder holding its curated images.
    pub source_folders_by_class: BTreeMap<String, PathBuf>,
}

impl TrainingJob {
    pub fn new(family: ModelFamily, epochs: u32) -> Self {
        Self {
            family,
            epochs,
            source_folders_by_class: BTreeMap::new(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        self.source_folders_by_class.insert(class.into(), folder.into());
        self
    }

    /// Job reading every class of `species` from `data_dir/<folder>`.
    pub fn from_data_dir(
        family: ModelFamily,
        epochs: u32,
        data_dir: &Path,
        species: &SpeciesRegistry,
    ) -> Self {
        species
            .folder_names()
            .fold(Self::new(family, epochs), |job, folder| {
                job.with_class(folder, data_dir.join(folder))
            })
    }

    /// Checks the job before any trainer is started.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidJob("epochs must be at least 1".into()));
        }
        if self.source_folders_by_class.len() < 2 {
            return Err(TrainingError::InvalidJob(format!(
                "need at least 2 classes, got {}",
                self.source_folders_by_class.len()
            )));
        }

        let inventory = FolderInventory::default();
        for (class, folder) in &self.source_folders_by_class {
            if !folder.is_dir() {
                return Err(TrainingError::InvalidJob(format!(
                    "folder for '{}' not found: {}",
                    class,
                    folder.display()
                )));
            }
            if inventory.count_images(folder) == 0 {
                return Err(TrainingError::InvalidJob(format!(
                    "folder for '{}' has no images: {}",
                    class,
                    folder.display()
                )));
            }
        }
        Ok(())
    }
}

/// Produces weights for a job.
pub trait Trainer: Send + Sync {
    /// Runs the job, forwarding progress lines to `sink`.
    fn train(&self, job: &TrainingJob, sink: &mut dyn FnMut(&str)) -> TrainingResult<WeightsHandle>;
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    family: &'a str,
    epochs: u32,
    /// Class folders in class-index order; output scores follow this order.
    classes: Vec<&'a str>,
    sources: &'a BTreeMap<String, PathBuf>,
}

/// Trainer run as an external program.
///
/// Placeholders in the argument list: `{manifest}` (JSON file describing the
/// job), `{epochs}`, `{output}` (where the weights must be written) and
/// `{family}`. Stdout and stderr are streamed line by line to the sink.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    spec: CommandSpec,
    species: SpeciesRegistry,
    weights_dir: PathBuf,
}

impl CommandTrainer {
    pub fn new(
        spec: CommandSpec,
        species: SpeciesRegistry,
        weights_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spec,
            species,
            weights_dir: weights_dir.into(),
        }
    }

    /// Trainer configured under `[models.<family>]`.
    pub fn from_config(config: &TrapsortConfig, family: ModelFamily) -> TrainingResult<Self> {
        let spec = config
            .models
            .get(&family)
            .and_then(|model| model.trainer.clone())
            .ok_or(TrainingError::NoTrainer(family))?;
        let species = config
            .species_registry()
            .map_err(|e| TrainingError::InvalidJob(e.to_string()))?;
        Ok(Self::new(spec, species, &config.training.weights_dir))
    }

    fn write_manifest(&self, job: &TrainingJob, path: &Path) -> TrainingResult<()> {
        let mut classes = Vec::with_capacity(self.species.len());
        for class in self.species.classes() {
            if job.source_folders_by_class.contains_key(&class.folder_name) {
                classes.push(class.folder_name.as_str());
            }
        }
        if let Some(unknown) = job
            .source_folders_by_class
            .keys()
            .find(|folder| self.species.by_folder(folder).is_none())
        {
            return Err(TrainingError::InvalidJob(format!("unknown class '{}'", unknown)));
        }

        let manifest = Manifest {
            family: job.family.strategy_name(),
            epochs: job.epochs,
            classes,
            sources: &job.source_folders_by_class,
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| TrainingError::InvalidJob(e.to_string()))?;
        fs::write(path, json).map_err(|source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn run(&self, args: &[String], sink: &mut dyn FnMut(&str)) -> TrainingResult<()> {
        let command_error = |source: io::Error| TrainingError::Command {
            program: self.spec.program.clone(),
            source,
        };

        let reader = duct::cmd(&self.spec.program, args)
            .stderr_to_stdout()
            .unchecked()
            .reader()
            .map_err(command_error)?;

        for line in BufReader::new(&reader).lines() {
            let line = line.map_err(command_error)?;
            debug!(target: "trapsort::trainer", "{}", line);
            sink(&line);
        }

        match reader.try_wait().map_err(command_error)? {
            Some(output) if output.status.success() => Ok(()),
            Some(output) => Err(TrainingError::Failed {
                program: self.spec.program.clone(),
                status: output.status.to_string(),
            }),
            None => Err(TrainingError::Failed {
                program: self.spec.program.clone(),
                status: "did not exit".to_string(),
            }),
        }
    }
}

impl Trainer for CommandTrainer {
    fn train(
        &self,
        job: &TrainingJob,
        sink: &mut dyn FnMut(&str),
    ) -> TrainingResult<WeightsHandle> {
        fs::create_dir_all(&self.weights_dir).map_err(|source| TrainingError::Io {
            path: self.weights_dir.clone(),
            source,
        })?;

        let stem = format!(
            "{}-{}",
            job.family.strategy_name(),
            Local::now().format("%Y%m%d-%H%M%S%.3f")
        );
        let manifest = self.weights_dir.join(format!("{}.manifest.json", stem));
        let output = self.weights_dir.join(format!("{}.weights", stem));
        self.write_manifest(job, &manifest)?;

        let manifest_arg = manifest.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let epochs = job.epochs.to_string();
        let args = self.spec.render_args(&[
            ("manifest", manifest_arg.as_ref()),
            ("epochs", epochs.as_str()),
            ("output", output_arg.as_ref()),
            ("family", job.family.strategy_name()),
        ]);
        info!(
            family = %job.family,
            epochs = job.epochs,
            output = %output.display(),
            "training started"
        );

        let result = self.run(&args, sink).and_then(|()| {
            if output.exists() {
                Ok(())
            } else {
                Err(TrainingError::MissingArtifact(output.clone()))
            }
        });

        if let Err(e) = result {
            warn!(error = %e, "training failed, discarding partial output");
            remove_path(&output);
            remove_path(&manifest);
            return Err(e);
        }

        Ok(WeightsHandle {
            family: job.family,
            path: output,
        })
    }
}

fn remove_path(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = removed
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove");
    }
}

/// Validates, trains, and hot-swaps the retrained strategy.
pub struct TrainingOrchestrator {
    trainer: Box<dyn Trainer>,
    registry: Arc<StrategyRegistry>,
}

impl TrainingOrchestrator {
    pub fn new(trainer: Box<dyn Trainer>, registry: Arc<StrategyRegistry>) -> Self {
        Self { trainer, registry }
    }

    pub fn train_and_reload(
        &self,
        job: &TrainingJob,
        sink: &mut dyn FnMut(&str),
    ) -> TrainingResult<WeightsHandle> {
        job.validate()?;
        let handle = self.trainer.train(job, sink)?;
        self.registry.reload(job.family, &handle)?;
        info!(family = %job.family, weights = %handle.path.display(), "new weights active");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::ClassIndex;
    use crate::strategy::{
        ClassificationResult, ClassificationStrategy, ClassifyContext, RegistryResult, Verdict,
    };
    use tempfile::TempDir;

    fn curated_data() -> TempDir {
        let dir = TempDir::new().unwrap();
        for folder in ["deer", "roe_deer", "wild_boar", "empty"] {
            fs::create_dir(dir.path().join(folder)).unwrap();
            fs::write(dir.path().join(folder).join("a.jpg"), b"jpeg").unwrap();
        }
        dir
    }

    #[test]
    fn test_validate_accepts_curated_folders() {
        let data = curated_data();
        let job = TrainingJob::from_data_dir(
            ModelFamily::ResNet50,
            3,
            data.path(),
            &SpeciesRegistry::default(),
        );
        assert_eq!(job.source_folders_by_class.len(), 4);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_jobs() {
        let data = curated_data();
        let zero_epochs = TrainingJob::new(ModelFamily::ResNet50, 0)
            .with_class("deer", data.path().join("deer"))
            .with_class("empty", data.path().join("empty"));
        assert!(matches!(zero_epochs.validate(), Err(TrainingError::InvalidJob(_))));

        let one_class =
            TrainingJob::new(ModelFamily::ResNet50, 1).with_class("deer", data.path().join("deer"));
        assert!(matches!(one_class.validate(), Err(TrainingError::InvalidJob(_))));

        let missing = TrainingJob::new(ModelFamily::ResNet50, 1)
            .with_class("deer", data.path().join("deer"))
            .with_class("badger", data.path().join("badger"));
        assert!(matches!(missing.validate(), Err(TrainingError::InvalidJob(_))));

        fs::create_dir(data.path().join("fox")).unwrap();
        fs::write(data.path().join("fox/readme.txt"), "x").unwrap();
        let no_images = TrainingJob::new(ModelFamily::ResNet50, 1)
            .with_class("deer", data.path().join("deer"))
            .with_class("fox", data.path().join("fox"));
        assert!(matches!(no_images.validate(), Err(TrainingError::InvalidJob(_))));
    }

    struct FixedWeights(usize);

    impl ClassificationStrategy for FixedWeights {
        fn name(&self) -> &str {
            "fixed"
        }

        fn classify(&self, _: &Path, _: &ClassifyContext) -> ClassificationResult<Verdict> {
            Ok(Verdict::Class(ClassIndex(self.0)))
        }
    }

    fn registry_reading_weights() -> Arc<StrategyRegistry> {
        let registry = StrategyRegistry::new();
        registry
            .register_family(
                ModelFamily::MobileNetV3,
                Box::new(
                    |weights: Option<&Path>| -> RegistryResult<Arc<dyn ClassificationStrategy>> {
                        let class = match weights {
                            None => 0,
                            Some(path) => fs::read_to_string(path)
                                .ok()
                                .and_then(|s| s.trim().parse().ok())
                                .ok_or_else(|| RegistryError::Build("unreadable weights".into()))?,
                        };
                        Ok(Arc::new(FixedWeights(class)) as Arc<dyn ClassificationStrategy>)
                    },
                ),
                None,
            )
            .unwrap();
        Arc::new(registry)
    }

    /// Writes a fixed weights file and reports two progress lines.
    struct FakeTrainer {
        dir: PathBuf,
        contents: &'static str,
    }

    impl Trainer for FakeTrainer {
        fn train(
            &self,
            job: &TrainingJob,
            sink: &mut dyn FnMut(&str),
        ) -> TrainingResult<WeightsHandle> {
            sink("epoch 1/1");
            sink("done");
            let path = self.dir.join("w.bin");
            fs::write(&path, self.contents).unwrap();
            Ok(WeightsHandle {
                family: job.family,
                path,
            })
        }
    }

    fn classify_now(registry: &StrategyRegistry) -> Verdict {
        registry
            .get("mobilenet-v3")
            .unwrap()
            .classify(
                Path::new("a.jpg"),
                &ClassifyContext {
                    cursor: 0,
                    num_classes: 4,
                    deadline: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_train_and_reload_swaps_weights() {
        let data = curated_data();
        let out = TempDir::new().unwrap();
        let registry = registry_reading_weights();
        let orchestrator = TrainingOrchestrator::new(
            Box::new(FakeTrainer {
                dir: out.path().to_path_buf(),
                contents: "2",
            }),
            Arc::clone(&registry),
        );
        let job = TrainingJob::from_data_dir(
            ModelFamily::MobileNetV3,
            1,
            data.path(),
            &SpeciesRegistry::default(),
        );

        let mut lines = Vec::new();
        let handle = orchestrator
            .train_and_reload(&job, &mut |line: &str| lines.push(line.to_string()))
            .unwrap();

        assert_eq!(handle.family, ModelFamily::MobileNetV3);
        assert_eq!(lines, vec!["epoch 1/1", "done"]);
        assert_eq!(classify_now(&registry), Verdict::Class(ClassIndex(2)));
    }

    #[test]
    fn test_failed_reload_keeps_previous_weights() {
        let data = curated_data();
        let out = TempDir::new().unwrap();
        let registry = registry_reading_weights();
        let orchestrator = TrainingOrchestrator::new(
            Box::new(FakeTrainer {
                dir: out.path().to_path_buf(),
                contents: "garbage",
            }),
            Arc::clone(&registry),
        );
        let job = TrainingJob::from_data_dir(
            ModelFamily::MobileNetV3,
            1,
            data.path(),
            &SpeciesRegistry::default(),
        );

        let result = orchestrator.train_and_reload(&job, &mut |_: &str| {});
        assert!(matches!(result, Err(TrainingError::Registry(_))));
        assert_eq!(classify_now(&registry), Verdict::Class(ClassIndex(0)));
    }

    #[test]
    fn test_invalid_job_never_reaches_trainer() {
        let out = TempDir::new().unwrap();
        let orchestrator = TrainingOrchestrator::new(
            Box::new(FakeTrainer {
                dir: out.path().to_path_buf(),
                contents: "1",
            }),
            registry_reading_weights(),
        );
        let job = TrainingJob::new(ModelFamily::MobileNetV3, 5);
        assert!(matches!(
            orchestrator.train_and_reload(&job, &mut |_: &str| {}),
            Err(TrainingError::InvalidJob(_))
        ));
        assert!(!out.path().join("w.bin").exists());
    }

    #[cfg(unix)]
    mod command {
        use super::*;

        fn trainer(script: &str, weights_dir: &Path) -> CommandTrainer {
            CommandTrainer::new(
                CommandSpec {
                    program: "sh".into(),
                    args: vec![
                        "-c".into(),
                        script.into(),
                        "sh".into(),
                        "{manifest}".into(),
                        "{epochs}".into(),
                        "{output}".into(),
                        "{family}".into(),
                    ],
                },
                SpeciesRegistry::default(),
                weights_dir,
            )
        }

        fn job(data: &TempDir) -> TrainingJob {
            TrainingJob::from_data_dir(
                ModelFamily::EfficientNetB0,
                2,
                data.path(),
                &SpeciesRegistry::default(),
            )
        }

        #[test]
        fn test_streams_output_and_returns_artifact() {
            let data = curated_data();
            let out = TempDir::new().unwrap();
            let trainer = trainer(
                r#"echo "epochs $2 for $4"
                echo "warming up" >&2
                grep -q roe_deer "$1" && printf w > "$3""#,
                out.path(),
            );

            let mut lines = Vec::new();
            let handle = trainer
                .train(&job(&data), &mut |line: &str| lines.push(line.to_string()))
                .unwrap();

            assert!(handle.path.is_file());
            assert!(handle.path.starts_with(out.path()));
            assert_eq!(handle.family, ModelFamily::EfficientNetB0);
            assert!(lines.contains(&"epochs 2 for efficientnet-b0".to_string()));
            assert!(lines.contains(&"warming up".to_string()));
        }

        #[test]
        fn test_non_zero_exit_removes_partial_output() {
            let data = curated_data();
            let out = TempDir::new().unwrap();
            let trainer = trainer(r#"printf partial > "$3"; exit 2"#, out.path());

            let result = trainer.train(&job(&data), &mut |_: &str| {});
            assert!(matches!(result, Err(TrainingError::Failed { .. })));
            assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
        }

        #[test]
        fn test_missing_artifact_is_an_error() {
            let data = curated_data();
            let out = TempDir::new().unwrap();
            let trainer = trainer("echo finished", out.path());

            assert!(matches!(
                trainer.train(&job(&data), &mut |_: &str| {}),
                Err(TrainingError::MissingArtifact(_))
            ));
        }

        #[test]
        fn test_unknown_class_is_rejected() {
            let data = curated_data();
            let out = TempDir::new().unwrap();
            let trainer = trainer("exit 0", out.path());
            let job = TrainingJob::new(ModelFamily::EfficientNetB0, 1)
                .with_class("deer", data.path().join("deer"))
                .with_class("badger", data.path().join("deer"));

            assert!(matches!(
                trainer.train(&job, &mut |_: &str| {}),
                Err(TrainingError::InvalidJob(_))
            ));
        }
    }
}
