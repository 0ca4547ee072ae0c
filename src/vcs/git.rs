//! Local git operations through libgit2.

use std::path::{Path, PathBuf};
use std::time::Instant;

use git2::{BranchType, Commit, ErrorCode, Reference, Repository, WorktreeAddOptions};
use tokio::process::Command;

use crate::error::VcsError;

/// Longest slug kept in a branch name.
const MAX_SLUG_CHARS: usize = 50;

/// Directory (under the project) holding per-task worktrees.
pub const WORKTREE_DIR: &str = ".foreman/worktrees";

/// Lowercase, runs of anything but ASCII letters and digits collapsed to
/// one `-`, trimmed, cut to [`MAX_SLUG_CHARS`].
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    slug.truncate(MAX_SLUG_CHARS);
    slug.trim_end_matches('-').to_string()
}

/// `task/<id>-<slugified-title>`, or `task/<id>` for an empty title.
pub fn branch_name(task_id: &str, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("task/{task_id}")
    } else {
        format!("task/{task_id}-{slug}")
    }
}

/// Worktree location for a branch.
pub fn worktree_path(project: &Path, branch: &str) -> PathBuf {
    project.join(WORKTREE_DIR).join(branch.replace('/', "-"))
}

pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self, VcsError> {
        let _ = Repository::discover(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository, VcsError> {
        Ok(Repository::discover(&self.path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        let repo = self.repo()?;
        match repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `name` from `base` (or HEAD) unless it already exists.
    /// Nothing is checked out. Returns whether the branch was created.
    pub fn ensure_branch(&self, name: &str, base: Option<&str>) -> Result<bool, VcsError> {
        if self.branch_exists(name)? {
            tracing::debug!(branch = %name, "Branch already exists");
            return Ok(false);
        }
        let repo = self.repo()?;
        let commit = base_commit(&repo, base)?;
        repo.branch(name, &commit, false)?;
        tracing::info!(branch = %name, base = base.unwrap_or("HEAD"), commit = %commit.id(), "Created branch");
        Ok(true)
    }

    /// Worktree for `branch` at `dir`, created if missing and reused if
    /// it is already there.
    pub fn ensure_worktree(&self, branch: &str, dir: &Path) -> Result<PathBuf, VcsError> {
        let repo = self.repo()?;
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| branch.replace('/', "-"));

        if let Ok(existing) = repo.find_worktree(&name) {
            if existing.validate().is_ok() && dir.exists() {
                tracing::debug!(worktree = %name, path = %dir.display(), "Reusing worktree");
                return Ok(existing.path().to_path_buf());
            }
            // Stale admin entry from a removed directory.
            let mut prune = git2::WorktreePruneOptions::new();
            prune.valid(true).working_tree(true);
            existing.prune(Some(&mut prune))?;
        }

        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let branch_ref: Reference<'_> = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree = repo.worktree(&name, dir, Some(&opts))?;
        tracing::info!(worktree = %name, branch = %branch, path = %dir.display(), "Created worktree");
        Ok(worktree.path().to_path_buf())
    }

    pub fn remove_worktree(&self, dir: &Path) -> Result<(), VcsError> {
        let repo = self.repo()?;
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if let Ok(worktree) = repo.find_worktree(name) {
            let mut prune = git2::WorktreePruneOptions::new();
            prune.valid(true).working_tree(true);
            worktree.prune(Some(&mut prune))?;
        }
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

fn base_commit<'r>(repo: &'r Repository, base: Option<&str>) -> Result<Commit<'r>, VcsError> {
    let Some(base) = base else {
        return Ok(repo.head()?.peel_to_commit()?);
    };
    if let Ok(branch) = repo.find_branch(base, BranchType::Local) {
        return Ok(branch.get().peel_to_commit()?);
    }
    if let Ok(branch) = repo.find_branch(&format!("origin/{base}"), BranchType::Remote) {
        return Ok(branch.get().peel_to_commit()?);
    }
    Ok(repo.revparse_single(base)?.peel_to_commit()?)
}

/// `git push -u origin <branch>` from `dir`.
pub async fn push_branch(dir: &Path, branch: &str) -> Result<(), VcsError> {
    let started = Instant::now();
    let output = Command::new("git")
        .args(["push", "-u", "origin", branch])
        .current_dir(dir)
        .output()
        .await?;
    tracing::info!(
        branch = %branch,
        success = output.status.success(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "git push"
    );
    if !output.status.success() {
        return Err(VcsError::Command {
            program: "git push".to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
