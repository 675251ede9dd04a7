//! Tracks which database files currently have a live handle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::config::StoragePath;

/// Set of concrete paths with an open handle.
///
/// Constructed explicitly and shared between handles through an `Arc`; two
/// handles only exclude each other when they were opened against the same
/// registry. Paths are keyed by their canonical form, so `a/b/../x.db`,
/// `a/x.db` and a symlinked directory leading to the same file collide.
/// [`StoragePath::Memory`] is never tracked.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    open_paths: Mutex<HashSet<PathBuf>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`. Returns `false` if it is already claimed.
    pub fn register_if_absent(&self, path: &StoragePath) -> bool {
        match path.as_path() {
            None => true,
            Some(path) => self.lock().insert(key(path)),
        }
    }

    /// Release `path`. Returns `false` if it was not claimed.
    pub fn unregister(&self, path: &StoragePath) -> bool {
        match path.as_path() {
            None => false,
            Some(path) => self.lock().remove(&key(path)),
        }
    }

    pub fn contains(&self, path: &StoragePath) -> bool {
        path.as_path().is_some_and(|path| self.lock().contains(&key(path)))
    }

    /// Number of tracked (non-ephemeral) paths.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked.
        self.open_paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canonical form of `path`. A file that does not exist yet is resolved
/// through its parent directory; if that fails too the path is used as given.
fn key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concrete_path_registered_once() {
        let registry = InstanceRegistry::new();
        let path = StoragePath::file("/tmp/a.db");

        assert!(registry.register_if_absent(&path));
        assert!(!registry.register_if_absent(&path));
        assert!(registry.contains(&path));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&path));
        assert!(!registry.unregister(&path));
        assert!(registry.register_if_absent(&path));
    }

    #[test]
    fn test_memory_is_never_tracked() {
        let registry = InstanceRegistry::new();
        assert!(registry.register_if_absent(&StoragePath::Memory));
        assert!(registry.register_if_absent(&StoragePath::Memory));
        assert!(!registry.contains(&StoragePath::Memory));
        assert!(registry.is_empty());
        assert!(!registry.unregister(&StoragePath::Memory));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(InstanceRegistry::new());
        let path = StoragePath::file("/tmp/contended.db");

        let winners: usize = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let path = path.clone();
                thread::spawn(move || registry.register_if_absent(&path))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_equivalent_spellings_collide() {
        let registry = InstanceRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let plain = StoragePath::file(dir.path().join("test.db"));
        let dotted = StoragePath::file(dir.path().join("sub").join("..").join("test.db"));

        // Neither file exists yet.
        assert!(registry.register_if_absent(&plain));
        assert!(!registry.register_if_absent(&dotted));
        assert!(registry.contains(&dotted));

        assert!(registry.unregister(&dotted));
        assert!(!registry.contains(&plain));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_collides() {
        let registry = InstanceRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        let link = dir.path().join("link");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(registry.register_if_absent(&StoragePath::file(real.join("x.db"))));
        assert!(!registry.register_if_absent(&StoragePath::file(link.join("x.db"))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_separate_registries_are_independent() {
        let first = InstanceRegistry::new();
        let second = InstanceRegistry::new();
        let path = StoragePath::file("/tmp/b.db");
        assert!(first.register_if_absent(&path));
        assert!(second.register_if_absent(&path));
    }
}
