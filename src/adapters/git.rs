//! git2-backed branches, worktrees and merges.

use crate::collaborators::{MergeOutcome, VersionControl};
use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, IndexAddOption, Oid, Repository, Signature, Tree, WorktreeAddOptions,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The project repository. A `Repository` is opened per operation since
/// git2 handles cannot be shared across tasks.
pub struct GitWorkspace {
    repo_dir: PathBuf,
    target_branch: String,
}

impl GitWorkspace {
    pub fn new(repo_dir: &Path, target_branch: &str) -> Self {
        Self {
            repo_dir: repo_dir.to_path_buf(),
            target_branch: target_branch.to_string(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_dir).with_context(|| {
            format!("Failed to open git repository {}", self.repo_dir.display())
        })
    }

    /// Create `name` at the tip of the target branch unless it exists.
    /// Returns true when the branch was created.
    pub fn ensure_branch(&self, name: &str) -> Result<bool> {
        let repo = self.open()?;
        if repo.find_branch(name, BranchType::Local).is_ok() {
            return Ok(false);
        }
        let base = branch_tip(&repo, &self.target_branch)?;
        repo.branch(name, &base, false)
            .with_context(|| format!("Failed to create branch '{}'", name))?;
        debug!(branch = %name, from = %self.target_branch, "Branch created");
        Ok(true)
    }

    /// Create `name` like [`ensure_branch`](Self::ensure_branch), then merge
    /// each of `bases` into it so a dependent worker starts from its
    /// dependencies' output. A base that conflicts is skipped and left for
    /// integration. Returns true when the branch was created.
    pub async fn fork_branch(&self, name: &str, bases: &[String]) -> Result<bool> {
        if !self.ensure_branch(name)? {
            return Ok(false);
        }
        for base in bases {
            let outcome = self.merge(base, name).await?;
            if !outcome.success {
                warn!(
                    branch = %name,
                    base = %base,
                    conflicts = outcome.conflicts.len(),
                    "Dependency branch conflicts, not carried into worker branch"
                );
            }
        }
        Ok(true)
    }

    /// Check `branch` out into a linked worktree at `path`. An existing
    /// worktree at `path` is reused.
    pub fn add_worktree(&self, name: &str, branch: &str, path: &Path) -> Result<PathBuf> {
        if path.join(".git").exists() {
            return Ok(path.to_path_buf());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let repo = self.open()?;
        let reference = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", branch))?
            .into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to add worktree {}", path.display()))?;
        info!(worktree = %path.display(), branch = %branch, "Worktree added");
        Ok(path.to_path_buf())
    }

    /// Commit everything in the worktree at `workdir`. Returns the new
    /// commit id, or `None` when there was nothing to commit.
    pub fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(workdir)
            .with_context(|| format!("Failed to open worktree {}", workdir.display()))?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        if let Some(ref parent) = parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature()?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(commit_id.to_string()))
    }

    /// Move `target` to `new_tip`, refreshing the working tree when it has
    /// `target` checked out.
    fn advance(&self, repo: &Repository, target: &str, new_tip: Oid, message: &str) -> Result<()> {
        if checked_out(repo, target) {
            let commit = repo.find_commit(new_tip)?;
            repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))
                .with_context(|| format!("Failed to check out merged '{}'", target))?;
        }
        repo.reference(&format!("refs/heads/{}", target), new_tip, true, message)
            .with_context(|| format!("Failed to update '{}'", target))?;
        Ok(())
    }
}

fn signature() -> Result<Signature<'static>> {
    Ok(Signature::now("foreman", "foreman@localhost")?)
}

fn branch_tip<'r>(repo: &'r Repository, name: &str) -> Result<Commit<'r>> {
    repo.find_branch(name, BranchType::Local)
        .with_context(|| format!("Branch '{}' not found", name))?
        .get()
        .peel_to_commit()
        .with_context(|| format!("Branch '{}' has no commits", name))
}

fn same_entry(a: &Tree, b: &Tree, path: &Path) -> bool {
    match (a.get_path(path), b.get_path(path)) {
        (Ok(x), Ok(y)) => x.id() == y.id(),
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

fn checked_out(repo: &Repository, branch: &str) -> bool {
    !repo.is_bare()
        && repo
            .head()
            .ok()
            .and_then(|head| head.shorthand().map(|s| s == branch))
            .unwrap_or(false)
}

#[async_trait]
impl VersionControl for GitWorkspace {
    async fn merge(&self, source: &str, target: &str) -> Result<MergeOutcome> {
        let repo = self.open()?;
        let ours = branch_tip(&repo, target)?;
        let theirs = branch_tip(&repo, source)?;
        let base = repo.merge_base(ours.id(), theirs.id())?;

        if base == theirs.id() {
            debug!(source = %source, target = %target, "Already merged");
            return Ok(MergeOutcome::clean());
        }
        if base == ours.id() {
            self.advance(&repo, target, theirs.id(), &format!("foreman: fast-forward {}", source))?;
            info!(source = %source, target = %target, "Fast-forwarded");
            return Ok(MergeOutcome::clean());
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    paths.push(PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()));
                }
            }
            paths.sort();
            paths.dedup();
            info!(source = %source, target = %target, conflicts = paths.len(), "Merge conflicted");
            return Ok(MergeOutcome::conflicted(paths));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature()?;
        let message = format!("foreman: merge {} into {}", source, target);
        let commit_id = repo.commit(None, &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        self.advance(&repo, target, commit_id, &message)?;
        info!(source = %source, target = %target, commit = %commit_id, "Merged");
        Ok(MergeOutcome::clean())
    }

    async fn tag(&self, name: &str) -> Result<()> {
        let repo = self.open()?;
        let tip = branch_tip(&repo, &self.target_branch)?;
        repo.tag_lightweight(name, tip.as_object(), false)
            .with_context(|| format!("Failed to create tag '{}'", name))?;
        info!(tag = %name, commit = %tip.id(), "Tagged");
        Ok(())
    }

    async fn changed_paths(&self, source: &str, target: &str) -> Result<Vec<PathBuf>> {
        let repo = self.open()?;
        let theirs = branch_tip(&repo, source)?;
        let ours = branch_tip(&repo, target)?;
        let base = repo.find_commit(repo.merge_base(ours.id(), theirs.id())?)?;
        let (ours_tree, theirs_tree) = (ours.tree()?, theirs.tree()?);

        let diff = repo.diff_tree_to_tree(Some(&base.tree()?), Some(&theirs_tree), None)?;
        let mut paths: Vec<PathBuf> = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(Path::to_path_buf)
            })
            // Changes the target already has, e.g. from a dependency merged first
            .filter(|path| !same_entry(&ours_tree, &theirs_tree, path))
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn path_exists(&self, target: &str, path: &Path) -> Result<bool> {
        let repo = self.open()?;
        let tree = branch_tip(&repo, target)?.tree()?;
        Ok(tree.get_path(path).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::RepositoryInitOptions;
    use tempfile::TempDir;

    fn init(bare: bool) -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.bare(bare).initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        (dir, repo)
    }

    fn commit_file(repo: &Repository, branch: &str, name: &str, content: &str) {
        let sig = Signature::now("test", "test@localhost").unwrap();
        let refname = format!("refs/heads/{branch}");
        let parent = repo
            .find_reference(&refname)
            .ok()
            .and_then(|r| r.peel_to_commit().ok());
        let base = parent.as_ref().map(|c| c.tree().unwrap());
        let blob = repo.blob(content.as_bytes()).unwrap();
        let mut builder = repo.treebuilder(base.as_ref()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let parents: Vec<&Commit> = parent.iter().collect();
        repo.commit(Some(&refname), &sig, &sig, "test", &tree, &parents)
            .unwrap();
    }

    fn bare_workspace() -> (TempDir, Repository, GitWorkspace) {
        let (dir, repo) = init(true);
        commit_file(&repo, "main", "README.md", "hello\n");
        let git = GitWorkspace::new(dir.path(), "main");
        (dir, repo, git)
    }

    #[tokio::test]
    async fn test_fast_forward_merge() {
        let (_dir, repo, git) = bare_workspace();
        assert!(git.ensure_branch("foreman/a").unwrap());
        assert!(!git.ensure_branch("foreman/a").unwrap());
        commit_file(&repo, "foreman/a", "a.rs", "fn a() {}\n");

        let outcome = git.merge("foreman/a", "main").await.unwrap();
        assert!(outcome.success);
        assert!(git.path_exists("main", Path::new("a.rs")).await.unwrap());
    }

    #[tokio::test]
    async fn test_three_way_merge_and_changed_paths() {
        let (_dir, repo, git) = bare_workspace();
        git.ensure_branch("foreman/a").unwrap();
        git.ensure_branch("foreman/b").unwrap();
        commit_file(&repo, "foreman/a", "a.rs", "fn a() {}\n");
        commit_file(&repo, "foreman/b", "b.rs", "fn b() {}\n");

        assert_eq!(
            git.changed_paths("foreman/b", "main").await.unwrap(),
            vec![PathBuf::from("b.rs")]
        );

        assert!(git.merge("foreman/a", "main").await.unwrap().success);
        assert!(git.merge("foreman/b", "main").await.unwrap().success);
        assert!(git.path_exists("main", Path::new("a.rs")).await.unwrap());
        assert!(git.path_exists("main", Path::new("b.rs")).await.unwrap());

        let tip = branch_tip(&repo, "main").unwrap();
        assert_eq!(tip.parent_count(), 2);

        // Merging again is a no-op
        assert!(git.merge("foreman/b", "main").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_conflict_leaves_target_untouched() {
        let (_dir, repo, git) = bare_workspace();
        git.ensure_branch("foreman/a").unwrap();
        git.ensure_branch("foreman/b").unwrap();
        commit_file(&repo, "foreman/a", "README.md", "from a\n");
        commit_file(&repo, "foreman/b", "README.md", "from b\n");

        assert!(git.merge("foreman/a", "main").await.unwrap().success);
        let before = branch_tip(&repo, "main").unwrap().id();

        let outcome = git.merge("foreman/b", "main").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflicts, vec![PathBuf::from("README.md")]);
        assert_eq!(branch_tip(&repo, "main").unwrap().id(), before);
    }

    #[tokio::test]
    async fn test_fork_branch_carries_dependency_output() {
        let (_dir, repo, git) = bare_workspace();
        git.ensure_branch("foreman/db").unwrap();
        git.ensure_branch("foreman/auth").unwrap();
        commit_file(&repo, "foreman/db", "schema.sql", "create table users;\n");
        commit_file(&repo, "foreman/auth", "auth.rs", "fn login() {}\n");

        let bases = vec!["foreman/db".to_string(), "foreman/auth".to_string()];
        assert!(git.fork_branch("foreman/api", &bases).await.unwrap());
        assert!(git.path_exists("foreman/api", Path::new("schema.sql")).await.unwrap());
        assert!(git.path_exists("foreman/api", Path::new("auth.rs")).await.unwrap());
        assert!(!git.path_exists("main", Path::new("schema.sql")).await.unwrap());

        // An existing branch is left alone
        commit_file(&repo, "foreman/db", "seed.sql", "insert;\n");
        assert!(!git.fork_branch("foreman/api", &bases).await.unwrap());
        assert!(!git.path_exists("foreman/api", Path::new("seed.sql")).await.unwrap());

        // Integration later sees only the dependent's own changes
        assert!(git.merge("foreman/db", "main").await.unwrap().success);
        assert!(git.merge("foreman/auth", "main").await.unwrap().success);
        commit_file(&repo, "foreman/api", "api.rs", "fn api() {}\n");
        assert_eq!(
            git.changed_paths("foreman/api", "main").await.unwrap(),
            vec![PathBuf::from("api.rs")]
        );
    }

    #[tokio::test]
    async fn test_fork_branch_skips_conflicting_dependency() {
        let (_dir, repo, git) = bare_workspace();
        git.ensure_branch("foreman/a").unwrap();
        git.ensure_branch("foreman/b").unwrap();
        commit_file(&repo, "foreman/a", "README.md", "from a\n");
        commit_file(&repo, "foreman/b", "README.md", "from b\n");

        let bases = vec!["foreman/a".to_string(), "foreman/b".to_string()];
        assert!(git.fork_branch("foreman/c", &bases).await.unwrap());
        assert_eq!(
            branch_tip(&repo, "foreman/c").unwrap().id(),
            branch_tip(&repo, "foreman/a").unwrap().id()
        );
    }

    #[tokio::test]
    async fn test_tag_target_tip() {
        let (_dir, repo, git) = bare_workspace();
        git.tag("foreman/phase-1").await.unwrap();

        let tagged = repo
            .find_reference("refs/tags/foreman/phase-1")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(tagged.id(), branch_tip(&repo, "main").unwrap().id());
        assert!(git.tag("foreman/phase-1").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_branch_is_error() {
        let (_dir, _repo, git) = bare_workspace();
        assert!(git.merge("foreman/nope", "main").await.is_err());
    }

    #[test]
    fn test_worktree_commit_lands_on_branch() {
        let (dir, repo) = init(false);
        commit_file(&repo, "main", "README.md", "hello\n");
        repo.checkout_head(Some(CheckoutBuilder::new().force())).unwrap();

        let git = GitWorkspace::new(dir.path(), "main");
        git.ensure_branch("foreman/api").unwrap();
        let worktrees = TempDir::new().unwrap();
        let path = worktrees.path().join("api");
        let workdir = git.add_worktree("foreman-api", "foreman/api", &path).unwrap();
        assert!(workdir.join("README.md").exists());

        std::fs::write(workdir.join("api.rs"), "fn api() {}\n").unwrap();
        assert!(git.commit_all(&workdir, "wip").unwrap().is_some());
        assert!(git.commit_all(&workdir, "wip").unwrap().is_none());

        let tip = branch_tip(&repo, "foreman/api").unwrap();
        assert!(tip.tree().unwrap().get_path(Path::new("api.rs")).is_ok());

        // Re-adding reuses the existing worktree
        assert_eq!(git.add_worktree("foreman-api", "foreman/api", &path).unwrap(), path);
    }
}
