//! Working path resolution and repository creation.

use crate::repository::{init_bare, is_repository, RepositoryDescriptor};
use crate::{RepoError, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name of the child directory.
    pub name: String,
    /// True if the child carries the repository signature.
    pub is_repository: bool,
}

/// Maps URL working paths onto repositories below a fixed root.
#[derive(Debug, Clone)]
pub struct RepositoryLocator {
    root: PathBuf,
}

impl RepositoryLocator {
    /// Creates a locator for `root`, which should be absolute.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The served root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `working_path` onto the root, folding `.` and `..` without
    /// touching the filesystem. Fails if the result would leave the root.
    pub fn resolve(&self, working_path: &str) -> Result<PathBuf> {
        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in Path::new(working_path).components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(RepoError::PathTraversal(working_path.to_string()));
                    }
                }
                Component::Prefix(_) => {
                    return Err(RepoError::PathTraversal(working_path.to_string()));
                }
            }
        }

        let mut resolved = self.root.clone();
        resolved.extend(parts);
        Ok(resolved)
    }

    /// Resolves and inspects `working_path`.
    pub fn describe(&self, working_path: &str) -> Result<RepositoryDescriptor> {
        Ok(RepositoryDescriptor::inspect(self.resolve(working_path)?))
    }

    /// Resolves `working_path` and requires a repository there.
    pub fn open(&self, working_path: &str) -> Result<RepositoryDescriptor> {
        let descriptor = self.describe(working_path)?;
        if !descriptor.is_valid {
            return Err(RepoError::NotFound(working_path.to_string()));
        }
        Ok(descriptor)
    }

    /// Like [`open`](Self::open), but creates a bare repository first when
    /// `create` is set and nothing exists at the path yet. An existing
    /// directory without the signature is never touched.
    ///
    /// Returns the descriptor and whether this call created it.
    pub fn open_or_create(
        &self,
        working_path: &str,
        create: bool,
    ) -> Result<(RepositoryDescriptor, bool)> {
        let descriptor = self.describe(working_path)?;
        if descriptor.is_valid {
            return Ok((descriptor, false));
        }
        if create && !descriptor.root_path.exists() {
            return Ok((self.create_bare(working_path)?, true));
        }
        Err(RepoError::NotFound(working_path.to_string()))
    }

    /// Creates a bare repository at `working_path`.
    ///
    /// The skeleton is written into a hidden staging directory beside the
    /// target and renamed into place. The rename only succeeds while the
    /// target is absent (or an empty directory), so when two requests race
    /// exactly one wins and the other gets
    /// [`RepoError::CreationConflict`]. The loser's staging directory is
    /// removed.
    pub fn create_bare(&self, working_path: &str) -> Result<RepositoryDescriptor> {
        let target = self.resolve(working_path)?;
        let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
            return Err(RepoError::CreationConflict(working_path.to_string()));
        };
        if target == self.root {
            return Err(RepoError::CreationConflict(working_path.to_string()));
        }

        fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.ges-init-", name.to_string_lossy()))
            .tempdir_in(parent)?;
        init_bare(staging.path())?;

        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                // The staging path is gone; dropping the guard is a no-op.
                drop(staging);
                tracing::info!(path = %target.display(), "Created bare repository");
                Ok(RepositoryDescriptor::inspect(target))
            }
            Err(_) if target.exists() => {
                tracing::debug!(path = %target.display(), "Lost repository creation race");
                Err(RepoError::CreationConflict(working_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the visible child directories of `working_path`, sorted by
    /// name. Hidden entries (leading `.`) are skipped.
    pub fn list(&self, working_path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(working_path)?;
        if !dir.is_dir() {
            return Err(RepoError::NotFound(working_path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            entries.push(DirEntry {
                is_repository: is_repository(&entry.path()),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
