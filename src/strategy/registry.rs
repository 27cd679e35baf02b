//! Named strategies with hot-swap support.
//!
//! Lookups hand out an `Arc`, so a classification that started before a swap
//! finishes on the instance it started with. A swap replaces the whole
//! instance at once; there is no window in which half-loaded weights can be
//! observed.

use super::{
    Cascade, CascadeOptions, ClassificationStrategy, CommandClassifier, CommandDetector,
    RANDOM, ROUND_ROBIN, RandomStrategy, RoundRobinStrategy,
};
use crate::config::{ModelConfig, ModelFamily, TrapsortConfig};
use crate::training::WeightsHandle;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Builds a family's strategy for the given weights.
pub type StrategyBuilder = Box<
    dyn Fn(Option<&Path>) -> Result<Arc<dyn ClassificationStrategy>, RegistryError> + Send + Sync,
>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),
    #[error("No model configured for family '{0}'")]
    UnknownFamily(ModelFamily),
    #[error("Weights were trained for '{got}', not '{expected}'")]
    FamilyMismatch {
        expected: ModelFamily,
        got: ModelFamily,
    },
    #[error("Weights file {} not found", .0.display())]
    MissingWeights(PathBuf),
    #[error("Failed to build strategy: {0}")]
    Build(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Strategies available to the engine, by name.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: RwLock<BTreeMap<String, Arc<dyn ClassificationStrategy>>>,
    builders: RwLock<HashMap<ModelFamily, StrategyBuilder>>,
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the content-blind strategies `random` and `round-robin`.
    pub fn with_builtins(seed: Option<u64>) -> Self {
        let registry = Self::new();
        let random = match seed {
            Some(seed) => RandomStrategy::with_seed(seed),
            None => RandomStrategy::new(),
        };
        registry.register(RANDOM, Arc::new(random));
        registry.register(ROUND_ROBIN, Arc::new(RoundRobinStrategy));
        registry
    }

    /// Built-ins plus one cascade per configured model family.
    pub fn from_config(config: &TrapsortConfig) -> RegistryResult<Self> {
        let registry = Self::with_builtins(config.engine.seed);
        for (&family, model) in &config.models {
            registry.register_family(
                family,
                cascade_builder(family, model.clone()),
                model.weights.as_deref(),
            )?;
        }
        Ok(registry)
    }

    /// Registers (or replaces) a strategy under `name`.
    pub fn register(&self, name: &str, strategy: Arc<dyn ClassificationStrategy>) {
        self.strategies.write().insert(name.to_string(), strategy);
    }

    /// Registers a retrainable family and builds its initial instance.
    pub fn register_family(
        &self,
        family: ModelFamily,
        builder: StrategyBuilder,
        weights: Option<&Path>,
    ) -> RegistryResult<()> {
        let strategy = builder(weights)?;
        self.register(family.strategy_name(), strategy);
        self.builders.write().insert(family, builder);
        Ok(())
    }

    /// Looks up a strategy by name.
    pub fn get(&self, name: &str) -> RegistryResult<Arc<dyn ClassificationStrategy>> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStrategy(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.read().contains_key(name)
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.strategies.read().keys().cloned().collect()
    }

    /// Rebuilds `family` with freshly trained weights and swaps it in.
    ///
    /// On any error the instance that was active before stays in force.
    pub fn reload(&self, family: ModelFamily, weights: &WeightsHandle) -> RegistryResult<()> {
        if weights.family != family {
            return Err(RegistryError::FamilyMismatch {
                expected: family,
                got: weights.family,
            });
        }
        if !weights.path.is_file() {
            return Err(RegistryError::MissingWeights(weights.path.clone()));
        }

        let strategy = {
            let builders = self.builders.read();
            let builder = builders
                .get(&family)
                .ok_or(RegistryError::UnknownFamily(family))?;
            builder(Some(&weights.path))?
        };

        self.register(family.strategy_name(), strategy);
        info!(%family, weights = %weights.path.display(), "reloaded strategy");
        Ok(())
    }
}

/// Builder for a configured detector + classifier cascade.
fn cascade_builder(family: ModelFamily, model: ModelConfig) -> StrategyBuilder {
    Box::new(move |weights: Option<&Path>| -> RegistryResult<Arc<dyn ClassificationStrategy>> {
        let options = CascadeOptions {
            target_labels: model.target_labels.clone(),
            min_confidence: model.min_confidence,
        };
        let detector = CommandDetector::new(model.detector.clone(), None);
        let classifier =
            CommandClassifier::new(model.classifier.clone(), weights.map(Path::to_path_buf));
        let cascade = Cascade::new(
            family.strategy_name(),
            Box::new(detector),
            Box::new(classifier),
            options,
        );
        Ok(Arc::new(cascade) as Arc<dyn ClassificationStrategy>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::ClassIndex;
    use crate::strategy::{ClassificationResult, ClassifyContext, Verdict};
    use tempfile::TempDir;

    /// Always answers the class written in its weights file.
    struct Labelled(usize);

    impl ClassificationStrategy for Labelled {
        fn name(&self) -> &str {
            "labelled"
        }

        fn classify(&self, _: &Path, _: &ClassifyContext) -> ClassificationResult<Verdict> {
            Ok(Verdict::Class(ClassIndex(self.0)))
        }
    }

    fn labelled_builder() -> StrategyBuilder {
        Box::new(|weights: Option<&Path>| -> RegistryResult<Arc<dyn ClassificationStrategy>> {
            let class = match weights {
                None => 0,
                Some(path) => std::fs::read_to_string(path)
                    .map_err(|e| RegistryError::Build(e.to_string()))?
                    .trim()
                    .parse()
                    .map_err(|_| RegistryError::Build("bad weights".into()))?,
            };
            Ok(Arc::new(Labelled(class)) as Arc<dyn ClassificationStrategy>)
        })
    }

    const CTX: ClassifyContext = ClassifyContext {
        cursor: 0,
        num_classes: 4,
        deadline: None,
    };

    #[test]
    fn test_builtins_are_registered() {
        let registry = StrategyRegistry::with_builtins(Some(3));
        assert_eq!(registry.names(), vec!["random", "round-robin"]);
        assert!(registry.get("random").is_ok());
        assert!(matches!(
            registry.get("resnet50"),
            Err(RegistryError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_from_config_registers_families() {
        let config = TrapsortConfig::from_toml(
            r#"
            [models.mobilenet-v3]
            detector = { program = "d" }
            classifier = { program = "c" }
            "#,
        )
        .unwrap();
        let registry = StrategyRegistry::from_config(&config).unwrap();
        assert!(registry.contains("mobilenet-v3"));
        assert_eq!(registry.get("mobilenet-v3").unwrap().name(), "mobilenet-v3");
    }

    #[test]
    fn test_reload_swaps_and_keeps_old_handles_alive() {
        let dir = TempDir::new().unwrap();
        let weights_path = dir.path().join("w");
        std::fs::write(&weights_path, "2").unwrap();

        let registry = StrategyRegistry::new();
        registry
            .register_family(ModelFamily::ResNet50, labelled_builder(), None)
            .unwrap();

        let before = registry.get("resnet50").unwrap();
        registry
            .reload(
                ModelFamily::ResNet50,
                &WeightsHandle {
                    family: ModelFamily::ResNet50,
                    path: weights_path,
                },
            )
            .unwrap();
        let after = registry.get("resnet50").unwrap();

        assert_eq!(
            before.classify(Path::new("a.jpg"), &CTX).unwrap(),
            Verdict::Class(ClassIndex(0))
        );
        assert_eq!(
            after.classify(Path::new("a.jpg"), &CTX).unwrap(),
            Verdict::Class(ClassIndex(2))
        );
    }

    #[test]
    fn test_failed_reload_keeps_previous_instance() {
        let dir = TempDir::new().unwrap();
        let weights_path = dir.path().join("w");
        std::fs::write(&weights_path, "not a number").unwrap();

        let registry = StrategyRegistry::new();
        registry
            .register_family(ModelFamily::ResNet50, labelled_builder(), None)
            .unwrap();

        let handle = WeightsHandle {
            family: ModelFamily::ResNet50,
            path: weights_path,
        };
        assert!(matches!(
            registry.reload(ModelFamily::ResNet50, &handle),
            Err(RegistryError::Build(_))
        ));
        assert_eq!(
            registry
                .get("resnet50")
                .unwrap()
                .classify(Path::new("a.jpg"), &CTX)
                .unwrap(),
            Verdict::Class(ClassIndex(0))
        );
    }

    #[test]
    fn test_reload_rejects_bad_handles() {
        let registry = StrategyRegistry::new();
        registry
            .register_family(ModelFamily::ResNet50, labelled_builder(), None)
            .unwrap();

        let mismatched = WeightsHandle {
            family: ModelFamily::MobileNetV3,
            path: PathBuf::from("/tmp/whatever"),
        };
        assert!(matches!(
            registry.reload(ModelFamily::ResNet50, &mismatched),
            Err(RegistryError::FamilyMismatch { .. })
        ));

        let missing = WeightsHandle {
            family: ModelFamily::ResNet50,
            path: PathBuf::from("/no/such/weights.bin"),
        };
        assert!(matches!(
            registry.reload(ModelFamily::ResNet50, &missing),
            Err(RegistryError::MissingWeights(_))
        ));
    }

    #[test]
    fn test_reload_unknown_family() {
        let dir = TempDir::new().unwrap();
        let weights_path = dir.path().join("w");
        std::fs::write(&weights_path, "1").unwrap();

        let registry = StrategyRegistry::with_builtins(None);
        let handle = WeightsHandle {
            family: ModelFamily::EfficientNetB0,
            path: weights_path,
        };
        assert!(matches!(
            registry.reload(ModelFamily::EfficientNetB0, &handle),
            Err(RegistryError::UnknownFamily(_))
        ));
    }
}
