//! Repository signature and bare skeleton.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What the filesystem says about a resolved working path.
///
/// Computed per request; never cached because pushes from other clients
/// may change the answer at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    /// Absolute, normalized path inside the served root.
    pub root_path: PathBuf,
    /// True if the directory carries the repository signature.
    pub is_valid: bool,
    /// True if the repository has no working tree.
    pub is_bare: bool,
}

impl RepositoryDescriptor {
    /// Inspects `path`.
    pub fn inspect(path: impl Into<PathBuf>) -> Self {
        let root_path = path.into();
        let is_valid = is_repository(&root_path);
        let is_bare = is_valid && detect_bare(&root_path);
        Self {
            root_path,
            is_valid,
            is_bare,
        }
    }
}

/// Returns true if `path` looks like a git directory: a `HEAD` file next
/// to `objects/` and `refs/` directories. The directory name is irrelevant.
pub fn is_repository(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
}

fn detect_bare(path: &Path) -> bool {
    if path.file_name().is_some_and(|name| name == ".git") {
        return false;
    }
    match fs::read_to_string(path.join("config")) {
        Ok(config) => config
            .lines()
            .map(|line| line.split_whitespace().collect::<String>())
            .any(|line| line.eq_ignore_ascii_case("bare=true")),
        Err(_) => false,
    }
}

/// Writes an empty bare repository into `git_dir`, which must exist and
/// be empty.
pub fn init_bare(git_dir: &Path) -> io::Result<()> {
    create_config(git_dir)?;
    create_description(git_dir)?;
    create_head(git_dir)?;
    fs::create_dir_all(git_dir.join("hooks"))?;
    create_info_dir(git_dir)?;
    create_objects_dir(git_dir)?;
    create_refs_dir(git_dir)?;
    Ok(())
}

fn create_config(git_dir: &Path) -> io::Result<()> {
    let config_txt = "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";
    fs::write(git_dir.join("config"), config_txt)
}

fn create_description(git_dir: &Path) -> io::Result<()> {
    let desc_txt = "Unnamed repository; edit this file 'description' to name the repository.\n";
    fs::write(git_dir.join("description"), desc_txt)
}

fn create_head(git_dir: &Path) -> io::Result<()> {
    fs::write(git_dir.join("HEAD"), "ref: refs/heads/master\n")
}

fn create_info_dir(git_dir: &Path) -> io::Result<()> {
    let info_dir = git_dir.join("info");
    fs::create_dir_all(&info_dir)?;
    fs::write(
        info_dir.join("exclude"),
        "# git ls-files --others --exclude-from=.git/info/exclude\n",
    )
}

fn create_objects_dir(git_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(git_dir.join("objects/info"))?;
    fs::create_dir_all(git_dir.join("objects/pack"))
}

fn create_refs_dir(git_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(git_dir.join("refs/heads"))?;
    fs::create_dir_all(git_dir.join("refs/tags"))
}
