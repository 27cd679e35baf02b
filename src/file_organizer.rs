/// Moving images into their class folders.
///
/// This module owns the single file-system mutation of a sorting run: moving
/// one image from its source location into `root/<class folder>/<file name>`.
/// Existing files are never overwritten.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Records a completed move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRecord {
    /// Where the image was before the move.
    pub source: PathBuf,
    /// Where the image is now.
    pub destination: PathBuf,
    /// The class folder the image was moved into.
    pub class_folder: String,
}

/// Errors that can occur while moving an image.
#[derive(Debug, Error)]
pub enum MoveError {
    /// The class folder is missing; destination folders must be prepared first.
    #[error("Destination folder {} does not exist", .0.display())]
    MissingDestinationFolder(PathBuf),
    /// A file with the same name is already in the class folder.
    #[error("{} already exists", .0.display())]
    DestinationExists(PathBuf),
    /// The source file vanished before it could be moved.
    #[error("Source file {} not found", .0.display())]
    SourceMissing(PathBuf),
    /// The source path has no file name component.
    #[error("{} has no file name", .0.display())]
    NoFileName(PathBuf),
    /// The underlying rename or copy failed.
    #[error("Failed to move {} to {}: {source}", .from.display(), .to.display())]
    FileMoveFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for move operations.
pub type MoveResult<T> = Result<T, MoveError>;

/// Moves images into class subdirectories of a root folder.
pub struct FileOrganizer;

impl FileOrganizer {
    /// Moves `file_path` into `root/<class_folder>/` keeping its file name.
    ///
    /// The class folder must already exist. Fails with
    /// [`MoveError::DestinationExists`] rather than overwriting. A rename that
    /// crosses devices falls back to copy + remove.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trapsort::file_organizer::FileOrganizer;
    /// use std::path::Path;
    ///
    /// let result = FileOrganizer::move_into_class(
    ///     Path::new("/traps/cam1"),
    ///     Path::new("/traps/cam1/IMG_0001.JPG"),
    ///     "deer",
    /// );
    ///
    /// match result {
    ///     Ok(record) => println!("Moved to {}", record.destination.display()),
    ///     Err(e) => eprintln!("Move failed: {}", e),
    /// }
    /// ```
    pub fn move_into_class(
        root: &Path,
        file_path: &Path,
        class_folder: &str,
    ) -> MoveResult<MoveRecord> {
        let folder_path = root.join(class_folder);
        if !folder_path.is_dir() {
            return Err(MoveError::MissingDestinationFolder(folder_path));
        }

        let file_name = file_path
            .file_name()
            .ok_or_else(|| MoveError::NoFileName(file_path.to_path_buf()))?;
        let destination = folder_path.join(file_name);

        if !file_path.is_file() {
            return Err(MoveError::SourceMissing(file_path.to_path_buf()));
        }
        if destination.exists() {
            return Err(MoveError::DestinationExists(destination));
        }

        Self::rename_or_copy(file_path, &destination).map_err(|source| {
            MoveError::FileMoveFailure {
                from: file_path.to_path_buf(),
                to: destination.clone(),
                source,
            }
        })?;

        debug!(from = %file_path.display(), to = %destination.display(), "moved image");
        Ok(MoveRecord {
            source: file_path.to_path_buf(),
            destination,
            class_folder: class_folder.to_string(),
        })
    }

    fn rename_or_copy(from: &Path, to: &Path) -> io::Result<()> {
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                Self::copy_then_remove(from, to, |from, to| fs::copy(from, to))
            }
            Err(e) => Err(e),
        }
    }

    /// Cross-device move. On any failure nothing is left at `to`.
    fn copy_then_remove(
        from: &Path,
        to: &Path,
        copy: impl FnOnce(&Path, &Path) -> io::Result<u64>,
    ) -> io::Result<()> {
        copy(from, to)
            .and_then(|_| fs::remove_file(from))
            .inspect_err(|_| {
                let _ = fs::remove_file(to);
            })
    }
}
