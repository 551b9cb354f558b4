//! # Ges Repo
//!
//! Finds repositories under a served root directory.
//!
//! A directory is a repository when it carries the on-disk signature
//! (`HEAD`, `objects/`, `refs/`), whatever its name. Working paths coming
//! from URLs are resolved lexically against the root and rejected if they
//! climb out of it. New bare repositories are staged next to their final
//! location and renamed into place, so concurrent creators cannot both
//! win.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod locator;
mod repository;

pub use error::{RepoError, Result};
pub use locator::{DirEntry, RepositoryLocator};
pub use repository::{init_bare, is_repository, RepositoryDescriptor};
