//! Folder inventory: queue building, destination folders and per-class counts.
//!
//! The inventory is stateless. Counts are always recomputed from the file
//! system; a snapshot is a display artifact and nothing depends on it for
//! correctness.

use crate::config::ScanFilters;
use crate::species::SpeciesRegistry;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Extensions recognized as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "bmp"];

/// Errors raised while scanning or preparing folders.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Folder not found: {}", .0.display())]
    RootNotFound(PathBuf),
    #[error("Failed to create directory {}: {source}", .path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("Failed to scan {}: {source}", .path.display())]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

pub type InventoryResult<T> = Result<T, InventoryError>;

/// A queued image. Never mutated once the queue is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageQueueEntry {
    pub source_path: PathBuf,
}

impl ImageQueueEntry {
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.source_path.file_name()
    }
}

/// Per-class image counts as `(folder, count)` pairs in class-index order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventorySnapshot {
    pub per_class_count: Vec<(String, usize)>,
}

impl InventorySnapshot {
    pub fn total(&self) -> usize {
        self.per_class_count.iter().map(|(_, count)| count).sum()
    }

    pub fn count(&self, folder: &str) -> usize {
        self.iter()
            .find(|(name, _)| *name == folder)
            .map_or(0, |(_, count)| count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.per_class_count
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
    }
}

/// Returns true if `path` has a recognized image extension.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Scans folders for images and maintains the species destination layout.
#[derive(Debug, Clone, Default)]
pub struct FolderInventory {
    filters: ScanFilters,
}

impl FolderInventory {
    pub fn new(filters: ScanFilters) -> Self {
        Self { filters }
    }

    /// Enumerates the images under `root`.
    ///
    /// Entries are sorted by file name within each directory, so the order is
    /// stable for a given tree. When `recursive` is set, the top-level
    /// destination folders of `species` are not descended into. Returns an
    /// empty queue when there are no images; the caller decides whether that
    /// is worth a warning.
    pub fn build_queue(
        &self,
        root: &Path,
        recursive: bool,
        species: &SpeciesRegistry,
    ) -> InventoryResult<Vec<ImageQueueEntry>> {
        if !root.is_dir() {
            return Err(InventoryError::RootNotFound(root.to_path_buf()));
        }

        let destinations: HashSet<OsString> =
            species.folder_names().map(OsString::from).collect();
        let max_depth = if recursive { usize::MAX } else { 1 };

        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_destination(entry, &destinations));

        let mut queue = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|source| InventoryError::ScanFailed {
                path: root.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if !self.filters.should_include(relative) {
                debug!(path = %relative.display(), "excluded by scan filters");
                continue;
            }
            queue.push(ImageQueueEntry {
                source_path: entry.into_path(),
            });
        }

        debug!(root = %root.display(), images = queue.len(), recursive, "built image queue");
        Ok(queue)
    }

    /// Creates `root/<folder>` for every class that lacks one. Idempotent.
    pub fn ensure_destination_folders(
        &self,
        root: &Path,
        species: &SpeciesRegistry,
    ) -> InventoryResult<()> {
        if !root.is_dir() {
            return Err(InventoryError::RootNotFound(root.to_path_buf()));
        }

        for folder in species.folder_names() {
            let path = root.join(folder);
            if path.is_dir() {
                continue;
            }
            if path.exists() {
                return Err(InventoryError::NotADirectory(path));
            }
            fs::create_dir_all(&path)
                .map_err(|source| InventoryError::DirectoryCreationFailed { path, source })?;
        }
        Ok(())
    }

    /// Counts recognized images under `folder`, including nested folders.
    ///
    /// A missing folder counts as zero. Unreadable entries are skipped since
    /// the count only feeds the display.
    pub fn count_images(&self, folder: &Path) -> usize {
        if !folder.is_dir() {
            return 0;
        }
        WalkDir::new(folder)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
            .count()
    }

    /// Counts every destination folder of `species` under `root`.
    pub fn snapshot(&self, root: &Path, species: &SpeciesRegistry) -> InventorySnapshot {
        let per_class_count = species
            .folder_names()
            .map(|folder| (folder.to_string(), self.count_images(&root.join(folder))))
            .collect();
        InventorySnapshot { per_class_count }
    }
}

fn is_destination(entry: &DirEntry, destinations: &HashSet<OsString>) -> bool {
    entry.depth() == 1 && entry.file_type().is_dir() && destinations.contains(entry.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"img").unwrap();
    }

    #[test]
    fn test_is_image_case_insensitive() {
        assert!(is_image(Path::new("a.JPG")));
        assert!(is_image(Path::new("a.Jpeg")));
        assert!(is_image(Path::new("dir/a.bmp")));
        assert!(!is_image(Path::new("a.tiff")));
        assert!(!is_image(Path::new("jpg")));
    }

    #[test]
    fn test_build_queue_top_level_only() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.jpg"));
        touch(&dir.path().join("a.PNG"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("nested/c.jpg"));

        let inventory = FolderInventory::default();
        let queue = inventory
            .build_queue(dir.path(), false, &SpeciesRegistry::default())
            .unwrap();
        let names: Vec<_> = queue
            .iter()
            .map(|e| e.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.jpg"]);
    }

    #[test]
    fn test_build_queue_recursive_skips_destinations() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a.jpg"));
        touch(&dir.path().join("cam2/day1/b.jpg"));
        touch(&dir.path().join("deer/already.jpg"));
        touch(&dir.path().join("cam2/deer/nested_not_destination.jpg"));

        let inventory = FolderInventory::default();
        let queue = inventory
            .build_queue(dir.path(), true, &SpeciesRegistry::default())
            .unwrap();
        assert_eq!(queue.len(), 3);
        assert!(queue.iter().all(|e| !e.source_path.ends_with("deer/already.jpg")));
    }

    #[test]
    fn test_build_queue_missing_root() {
        let inventory = FolderInventory::default();
        let result = inventory.build_queue(
            Path::new("/no/such/folder"),
            false,
            &SpeciesRegistry::default(),
        );
        assert!(matches!(result, Err(InventoryError::RootNotFound(_))));
    }

    #[test]
    fn test_build_queue_empty_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("readme.md"));
        let queue = FolderInventory::default()
            .build_queue(dir.path(), true, &SpeciesRegistry::default())
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_build_queue_applies_filters() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".hidden.jpg"));
        touch(&dir.path().join("keep.jpg"));
        touch(&dir.path().join("thumbs/skip.jpg"));

        let scan = ScanConfig {
            exclude_patterns: vec!["thumbs/**".to_string()],
            ..Default::default()
        };
        let inventory = FolderInventory::new(scan.compile().unwrap());
        let queue = inventory
            .build_queue(dir.path(), true, &SpeciesRegistry::default())
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue[0].source_path.ends_with("keep.jpg"));
    }

    #[test]
    fn test_ensure_destination_folders_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let species = SpeciesRegistry::default();
        let inventory = FolderInventory::default();

        inventory.ensure_destination_folders(dir.path(), &species).unwrap();
        let first = fs::read_dir(dir.path()).unwrap().count();
        inventory.ensure_destination_folders(dir.path(), &species).unwrap();
        let second = fs::read_dir(dir.path()).unwrap().count();

        assert_eq!(first, second);
        for folder in species.folder_names() {
            assert!(dir.path().join(folder).is_dir());
        }
    }

    #[test]
    fn test_ensure_destination_folders_rejects_file_in_the_way() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("deer"), b"not a dir").unwrap();
        let result = FolderInventory::default()
            .ensure_destination_folders(dir.path(), &SpeciesRegistry::default());
        assert!(matches!(result, Err(InventoryError::NotADirectory(_))));
    }

    #[test]
    fn test_count_images_is_recursive() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("deer/a.jpg"));
        touch(&dir.path().join("deer/2024-05/b.jpg"));
        touch(&dir.path().join("deer/info.txt"));

        let inventory = FolderInventory::default();
        assert_eq!(inventory.count_images(&dir.path().join("deer")), 2);
        assert_eq!(inventory.count_images(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_snapshot_counts_every_class() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("deer/a.jpg"));
        touch(&dir.path().join("empty/b.jpg"));
        touch(&dir.path().join("empty/c.gif"));

        let snapshot = FolderInventory::default().snapshot(dir.path(), &SpeciesRegistry::default());
        let folders: Vec<&str> = snapshot.iter().map(|(name, _)| name).collect();
        assert_eq!(folders, vec!["deer", "roe_deer", "wild_boar", "empty"]);
        assert_eq!(snapshot.count("deer"), 1);
        assert_eq!(snapshot.count("roe_deer"), 0);
        assert_eq!(snapshot.count("empty"), 2);
        assert_eq!(snapshot.total(), 3);
    }
}
