use std::io;
use std::path::{Path, PathBuf};

/// Everything under one directory, ordered for removal.
#[derive(Debug, Default)]
pub struct DirectoryTree {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
    /// Children before parents; `root` is last.
    pub dirs: Vec<PathBuf>,
    pub total_bytes: u64,
    /// Subdirectories that could not be listed. Their contents are missing
    /// from `files`.
    pub unreadable: Vec<(PathBuf, io::Error)>,
}

impl DirectoryTree {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Every entry in removal order: files, then directories deepest first.
    pub fn removal_order(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().chain(self.dirs.iter())
    }
}

/// Walks `root` depth-first. Directory symlinks and junctions are recorded
/// as directories to remove but never followed.
///
/// Fails only if `root` itself cannot be listed.
pub fn discover_tree(root: &Path) -> io::Result<DirectoryTree> {
    if !crate::winapi::path_exists(root) {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", root.display()),
        ));
    }

    let mut tree = DirectoryTree {
        root: root.to_path_buf(),
        ..Default::default()
    };

    let children = list_dir(root, &mut tree)?;
    for child in children {
        walk(&child, &mut tree);
    }
    tree.dirs.push(root.to_path_buf());

    Ok(tree)
}

fn walk(dir: &Path, tree: &mut DirectoryTree) {
    match list_dir(dir, tree) {
        Ok(children) => {
            for child in children {
                walk(&child, tree);
            }
        }
        Err(e) => {
            tracing::warn!("cannot read {}: {}", dir.display(), e);
            tree.unreadable.push((dir.to_path_buf(), e));
        }
    }
    tree.dirs.push(dir.to_path_buf());
}

/// Records the files of `dir` in `tree` and returns the subdirectories to descend into.
fn list_dir(dir: &Path, tree: &mut DirectoryTree) -> io::Result<Vec<PathBuf>> {
    let mut child_dirs = Vec::new();

    crate::winapi::enumerate_files(dir, |entry| {
        if entry.is_dir && entry.is_symlink {
            tree.dirs.push(entry.path);
        } else if entry.is_dir {
            child_dirs.push(entry.path);
        } else {
            tree.total_bytes += entry.size;
            tree.files.push(entry.path);
        }
        Ok(())
    })?;

    child_dirs.sort();
    Ok(child_dirs)
}

/// The files under `path`, or `path` itself when it is a file or cannot be expanded.
pub fn expand_files(path: &Path) -> Vec<PathBuf> {
    if !crate::winapi::is_directory(path) {
        return vec![path.to_path_buf()];
    }

    match discover_tree(path) {
        Ok(tree) if !tree.files.is_empty() => tree.files,
        Ok(_) => vec![path.to_path_buf()],
        Err(e) => {
            tracing::debug!("expansion of {} failed, using the entry itself: {}", path.display(), e);
            vec![path.to_path_buf()]
        }
    }
}
