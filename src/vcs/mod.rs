//! Version control: local branches and worktrees, plus the hosting CLI.

pub mod gh;
pub mod git;

pub use gh::{GhClient, Milestone, PullRequest, ReviewEvent, is_rate_limited};
pub use git::{GitRepo, WORKTREE_DIR, branch_name, push_branch, slugify, worktree_path};
