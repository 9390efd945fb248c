//! Worktree manager collaborator contract and its git-CLI implementation.
//!
//! Cells live in per-cell git worktrees carved out of the workspace root
//! checkout. Only the call contract matters to the orchestrator; the default
//! implementation shells out to `git worktree`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;

use crate::cell::Cell;
use crate::exec::run_command;

/// Result of creating a worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Absolute path of the worktree.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Commit the branch was created from.
    pub base_commit: String,
}

/// Creates and removes per-cell git worktrees.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Create the worktree for a cell, on its own branch.
    async fn create_worktree(&self, cell: &Cell) -> Result<WorktreeInfo>;

    /// Remove the cell's worktree and delete its branch.
    async fn remove_worktree(&self, cell: &Cell) -> Result<()>;
}

/// Default implementation shelling out to the `git` CLI.
pub struct GitWorktreeManager {
    /// Directory worktrees are created under.
    worktrees_dir: PathBuf,
}

impl GitWorktreeManager {
    /// Create a manager placing worktrees under the given directory.
    pub fn new(worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            worktrees_dir: worktrees_dir.into(),
        }
    }

    fn branch_for(cell: &Cell) -> String {
        format!("cellar/{}", cell.name)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    async fn create_worktree(&self, cell: &Cell) -> Result<WorktreeInfo> {
        let root = Path::new(&cell.workspace_root_path);
        let path = self.worktrees_dir.join(&cell.id);
        let branch = Self::branch_for(cell);
        let env = HashMap::new();

        std::fs::create_dir_all(&self.worktrees_dir)
            .with_context(|| format!("creating worktrees dir: {}", self.worktrees_dir.display()))?;

        let head = run_command("git rev-parse HEAD", root, &env)
            .await
            .context("resolving base commit")?;
        let base_commit = head.stdout.trim().to_string();

        run_command(
            &format!("git worktree add -b '{}' '{}' {}", branch, path.display(), base_commit),
            root,
            &env,
        )
        .await
        .context("creating git worktree")?;

        info!(
            "Created worktree for cell {} at {} (branch {})",
            cell.id,
            path.display(),
            branch
        );

        Ok(WorktreeInfo {
            path,
            branch,
            base_commit,
        })
    }

    async fn remove_worktree(&self, cell: &Cell) -> Result<()> {
        let root = Path::new(&cell.workspace_root_path);
        let env = HashMap::new();

        if let Some(ref path) = cell.workspace_path {
            run_command(
                &format!("git worktree remove --force '{}'", path),
                root,
                &env,
            )
            .await
            .context("removing git worktree")?;
        }

        if let Some(ref branch) = cell.branch_name {
            // Branch may already be gone; not an error.
            let _ = run_command(&format!("git branch -D '{}'", branch), root, &env).await;
        }

        info!("Removed worktree for cell {}", cell.id);
        Ok(())
    }
}
