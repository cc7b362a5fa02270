use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use rand::{Rng, seq::SliceRandom};

use crate::{Result, WorkerErr};

/// A labeled example file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub label: usize,
}

/// The files of a class labeled dataset, laid out as `root/<class>/<file>`.
///
/// Classes are the sorted names of the subdirectories of the root, so every worker derives the
/// same label for the same class. Entries are sorted by path.
#[derive(Debug, Clone)]
pub struct Catalog {
    classes: Vec<String>,
    entries: Vec<Entry>,
}

impl Catalog {
    /// Lists every file one level below the class directories of `root`.
    ///
    /// # Returns
    /// The catalog, or an error if `root` can't be read or holds no examples.
    pub fn scan(root: &Path) -> Result<Self> {
        let classes = class_dirs(root)?
            .iter()
            .map(|(name, _)| name.clone())
            .collect();

        Self::scan_with_classes(root, classes)
    }

    /// Lists every file one level below the class directories of `root`, labeling them with
    /// a class list taken from another catalog, typically the training one.
    ///
    /// # Returns
    /// The catalog, or an error if `root` can't be read, holds no examples or has a class
    /// directory that's not in `classes`.
    pub fn scan_with_classes(root: &Path, classes: Vec<String>) -> Result<Self> {
        let mut entries = Vec::new();

        for (name, dir) in class_dirs(root)? {
            let Some(label) = classes.iter().position(|c| *c == name) else {
                return Err(WorkerErr::Dataset(format!(
                    "{} holds the unknown class {name}",
                    root.display()
                )));
            };

            for file in fs::read_dir(&dir).map_err(|e| unreadable(&dir, e))? {
                let file = file.map_err(|e| unreadable(&dir, e))?;
                if file.file_type().map_err(|e| unreadable(&dir, e))?.is_file() {
                    entries.push(Entry {
                        path: file.path(),
                        label,
                    });
                }
            }
        }

        if entries.is_empty() {
            return Err(WorkerErr::Dataset(format!(
                "{} holds no examples",
                root.display()
            )));
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { classes, entries })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Returns the entries in path order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the share of worker `index` in a fleet of `count`: the entries `index`,
    /// `index + count` and so on, still in path order.
    ///
    /// The shards of every worker are disjoint and together hold every entry.
    pub fn shard(&self, index: usize, count: NonZeroUsize) -> Self {
        Self {
            classes: self.classes.clone(),
            entries: self
                .entries
                .iter()
                .skip(index)
                .step_by(count.get())
                .cloned()
                .collect(),
        }
    }

    /// Returns every entry in a random order drawn from `rng`.
    ///
    /// Seeding `rng` with the worker's rank makes each worker traverse the dataset differently
    /// while keeping the traversal reproducible across restarts.
    pub fn shuffled_listing<R: Rng>(&self, rng: &mut R) -> Vec<Entry> {
        let mut listing = self.entries.clone();
        listing.shuffle(rng);
        listing
    }
}

/// Returns the sorted `(name, path)` of every directory directly under `root`.
fn class_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();

    for entry in fs::read_dir(root).map_err(|e| unreadable(root, e))? {
        let entry = entry.map_err(|e| unreadable(root, e))?;
        if !entry.file_type().map_err(|e| unreadable(root, e))?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        dirs.push((name, entry.path()));
    }

    dirs.sort();
    Ok(dirs)
}

fn unreadable(path: &Path, e: std::io::Error) -> WorkerErr {
    WorkerErr::Dataset(format!("can't read {}: {e}", path.display()))
}
