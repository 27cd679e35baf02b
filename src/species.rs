/// Species taxonomy used as the destination layout of a sorting run.
///
/// A [`SpeciesRegistry`] is a fixed, ordered mapping from class index to the
/// name of the subfolder images of that class are moved into. Exactly one
/// class is designated as "empty": it receives frames with no detected animal
/// and every image whose classification failed.
///
/// # Examples
///
/// ```
/// use trapsort::species::{ClassIndex, SpeciesRegistry};
///
/// let species = SpeciesRegistry::default();
/// assert_eq!(species.len(), 4);
/// assert_eq!(species.folder_name(ClassIndex(0)), Some("deer"));
/// assert_eq!(species.empty().folder_name, "empty");
/// ```
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};
use thiserror::Error;

/// Default destination folders, in class-index order.
pub const DEFAULT_SPECIES: [&str; 4] = ["deer", "roe_deer", "wild_boar", "empty"];

/// Default name of the "no detection" folder.
pub const DEFAULT_EMPTY_FOLDER: &str = "empty";

/// Index of a class within a [`SpeciesRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassIndex(pub usize);

impl fmt::Display for ClassIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One destination label with its folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeciesClass {
    pub index: ClassIndex,
    pub folder_name: String,
}

/// Errors raised while building a species registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeciesError {
    #[error("species list is empty")]
    NoClasses,
    #[error("duplicate species folder '{0}'")]
    DuplicateFolder(String),
    #[error("invalid species folder name '{0}': must be a single path component")]
    InvalidFolderName(String),
    #[error("empty class folder '{0}' is not one of the species folders")]
    MissingEmptyClass(String),
}

/// Ordered, immutable set of destination classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeciesRegistry {
    classes: Vec<SpeciesClass>,
    empty: ClassIndex,
}

impl SpeciesRegistry {
    /// Builds a registry from folder names in index order.
    ///
    /// `empty_folder` must be one of `folders`; every folder name must be a
    /// plain, unique directory name.
    pub fn new<S: AsRef<str>>(folders: &[S], empty_folder: &str) -> Result<Self, SpeciesError> {
        if folders.is_empty() {
            return Err(SpeciesError::NoClasses);
        }

        let mut seen = HashSet::new();
        let mut classes = Vec::with_capacity(folders.len());
        for (index, folder) in folders.iter().enumerate() {
            let folder = folder.as_ref();
            if !is_plain_folder_name(folder) {
                return Err(SpeciesError::InvalidFolderName(folder.to_string()));
            }
            if !seen.insert(folder.to_string()) {
                return Err(SpeciesError::DuplicateFolder(folder.to_string()));
            }
            classes.push(SpeciesClass {
                index: ClassIndex(index),
                folder_name: folder.to_string(),
            });
        }

        let empty = classes
            .iter()
            .find(|class| class.folder_name == empty_folder)
            .map(|class| class.index)
            .ok_or_else(|| SpeciesError::MissingEmptyClass(empty_folder.to_string()))?;

        Ok(Self { classes, empty })
    }

    /// Number of classes, including the empty class.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// All classes in index order.
    pub fn classes(&self) -> &[SpeciesClass] {
        &self.classes
    }

    /// Iterates over the destination folder names in index order.
    pub fn folder_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|class| class.folder_name.as_str())
    }

    pub fn get(&self, index: ClassIndex) -> Option<&SpeciesClass> {
        self.classes.get(index.0)
    }

    /// Maps a class index to its folder name.
    pub fn folder_name(&self, index: ClassIndex) -> Option<&str> {
        self.get(index).map(|class| class.folder_name.as_str())
    }

    /// Looks up a class by folder name (exact match).
    pub fn by_folder(&self, folder: &str) -> Option<&SpeciesClass> {
        self.classes.iter().find(|class| class.folder_name == folder)
    }

    /// The designated "empty / no detection" class.
    pub fn empty(&self) -> &SpeciesClass {
        &self.classes[self.empty.0]
    }

    pub fn empty_index(&self) -> ClassIndex {
        self.empty
    }
}

impl Default for SpeciesRegistry {
    fn default() -> Self {
        let classes = DEFAULT_SPECIES
            .iter()
            .enumerate()
            .map(|(index, folder)| SpeciesClass {
                index: ClassIndex(index),
                folder_name: folder.to_string(),
            })
            .collect::<Vec<_>>();
        let empty = ClassIndex(DEFAULT_SPECIES.len() - 1);
        Self { classes, empty }
    }
}

fn is_plain_folder_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_layout() {
        let species = SpeciesRegistry::default();
        let names: Vec<_> = species.folder_names().collect();
        assert_eq!(names, vec!["deer", "roe_deer", "wild_boar", "empty"]);
        assert_eq!(species.empty_index(), ClassIndex(3));
    }

    #[test]
    fn test_indices_are_contiguous() {
        let species = SpeciesRegistry::new(&["a", "b", "c"], "c").unwrap();
        for (position, class) in species.classes().iter().enumerate() {
            assert_eq!(class.index, ClassIndex(position));
        }
    }

    #[test]
    fn test_lookup_by_folder() {
        let species = SpeciesRegistry::default();
        assert_eq!(
            species.by_folder("wild_boar").map(|c| c.index),
            Some(ClassIndex(2))
        );
        assert!(species.by_folder("Wild_Boar").is_none());
        assert_eq!(species.folder_name(ClassIndex(9)), None);
    }

    #[test]
    fn test_rejects_duplicates() {
        let result = SpeciesRegistry::new(&["deer", "deer", "empty"], "empty");
        assert_eq!(result, Err(SpeciesError::DuplicateFolder("deer".into())));
    }

    #[test]
    fn test_rejects_path_like_names() {
        assert!(SpeciesRegistry::new(&["a/b", "empty"], "empty").is_err());
        assert!(SpeciesRegistry::new(&["..", "empty"], "empty").is_err());
        assert!(SpeciesRegistry::new(&["", "empty"], "empty").is_err());
    }

    #[test]
    fn test_requires_empty_class() {
        let result = SpeciesRegistry::new(&["fox", "badger"], "empty");
        assert_eq!(
            result,
            Err(SpeciesError::MissingEmptyClass("empty".into()))
        );
        assert_eq!(
            SpeciesRegistry::new::<&str>(&[], "empty"),
            Err(SpeciesError::NoClasses)
        );
    }
}
