//! Crawler: converts tracked repositories into durable commit rows.
//!
//! Runs in two modes. The periodic mode scans every repo and re-arms itself
//! every [`CRAWLER_PERIOD`]; the triggered mode drains queued
//! [`RepoUpdate`] records (from the nudge endpoint or the push webhook) and
//! scans exactly one repo each. A git failure aborts only the affected
//! repo; a transient store failure retries the whole iteration after
//! [`RETRY_DELAY`](dataplane::store::RETRY_DELAY).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dataplane::model::{CommitStatus, Id, NewCommit, Repo};
use dataplane::store::{Store, StoreError, StoreTx, RETRY_DELAY};
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::scm::{full_match_pattern, GitSource, RepoAuth, RepoWorkspace, ScmError};
use crate::worker::{Nudge, Worker, WorkerCtx};

/// Period of the full scan over all repos.
pub const CRAWLER_PERIOD: Duration = Duration::from_secs(300);

/// A targeted scan request: one repo, optionally pinned to an exact
/// (sha, ref) pair from a push event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoUpdate {
    pub repo_id: Id,
    pub sha: String,
    pub ref_name: String,
}

/// Crawler iteration payload.
#[derive(Debug, Clone)]
pub enum CrawlerTask {
    AllRepos,
    Update(RepoUpdate),
}

#[derive(Debug, thiserror::Error)]
enum RepoError {
    #[error(transparent)]
    Scm(#[from] ScmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Crawler<S: Store, G: GitSource> {
    store: S,
    git: G,
    scheduler: Nudge,
    /// True until the first full scan armed the periodic chain; a plain
    /// trigger never starts a second chain.
    periodic: bool,
    /// Per-repo clones live here; removed again on cleanup.
    data_dir: Option<TempDir>,
}

impl<S: Store, G: GitSource> Crawler<S, G> {
    pub fn new(store: S, git: G, scheduler: Nudge) -> std::io::Result<Self> {
        let data_dir = TempDir::new()?;
        info!(path = %data_dir.path().display(), "created crawler data directory");
        Ok(Self {
            store,
            git,
            scheduler,
            periodic: true,
            data_dir: Some(data_dir),
        })
    }

    fn work_dir(&self, repo_id: Id) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap_or_else(std::env::temp_dir)
            .join(repo_id.to_string())
    }

    async fn process_all_repos(&self) -> Result<(), StoreError> {
        info!("start crawling all repos");
        let repos = {
            let mut tx = self.store.begin().await?;
            tx.repos().await?
        };

        let mut new_commits = false;
        for repo in &repos {
            match self.process_repo(repo, None).await {
                Ok(true) => new_commits = true,
                Ok(false) => {}
                Err(RepoError::Scm(err)) => {
                    error!(url = repo.url, error = %err, "failed to process repo");
                }
                Err(RepoError::Store(err)) => return Err(err),
            }
        }
        info!("finish crawling all repos");

        if new_commits {
            info!("trigger scheduler: process commits");
            self.scheduler.send();
        }
        Ok(())
    }

    async fn process_update(&self, update: &RepoUpdate) -> Result<(), StoreError> {
        info!(repo_id = update.repo_id, "start crawling triggered repo");
        let repo = {
            let mut tx = self.store.begin().await?;
            tx.repo(update.repo_id).await?
        };
        let Some(repo) = repo else {
            warn!(repo_id = update.repo_id, "triggered repo does not exist");
            return Ok(());
        };

        match self.process_repo(&repo, Some(update)).await {
            Ok(true) => {
                info!("trigger scheduler: process commits");
                self.scheduler.send();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(RepoError::Scm(err)) => {
                error!(url = repo.url, error = %err, "failed to process repo");
                Ok(())
            }
            Err(RepoError::Store(err)) => Err(err),
        }
    }

    /// Scan one repo; returns whether any new commit was inserted. The
    /// insert and the supersede of prior commits share one transaction.
    async fn process_repo(
        &self,
        repo: &Repo,
        update: Option<&RepoUpdate>,
    ) -> Result<bool, RepoError> {
        let work_dir = self.work_dir(repo.id);
        std::fs::create_dir_all(&work_dir).map_err(ScmError::Io)?;
        let workspace = self.git.open(work_dir, repo.url.clone()).await?;

        let mut tx = self.store.begin().await?;
        let configuration = tx.configuration().await?;
        workspace
            .materialize_credentials(RepoAuth {
                ssh_key: configuration.ssh_key,
                known_hosts: configuration.known_hosts,
                git_credentials: configuration.git_credentials,
            })
            .await?;
        info!(url = repo.url, "fetch repo");
        workspace.fetch().await?;

        let channels = tx.channels(repo.ecosystem_id).await?;
        let mut new_commits = false;
        for channel in &channels {
            match update {
                Some(update) if !update.sha.is_empty() && !update.ref_name.is_empty() => {
                    let matcher =
                        full_match_pattern(&channel.ref_pattern).map_err(ScmError::Pattern)?;
                    if !matcher.is_match(&update.ref_name) {
                        continue;
                    }
                    info!(ref_name = update.ref_name, pattern = channel.ref_pattern, "ref matches");
                    if !workspace.checkout_sha(update.sha.clone()).await? {
                        info!(sha = update.sha, "can not check out commit");
                        continue;
                    }
                    if self.process_commit(&mut tx, &workspace, repo, channel.id).await? {
                        new_commits = true;
                    }
                }
                _ => {
                    let refs = workspace
                        .matching_refs(channel.ref_pattern.clone())
                        .await?;
                    for ref_name in refs {
                        info!(ref_name, pattern = channel.ref_pattern, "ref matches");
                        workspace.checkout_ref(ref_name).await?;
                        if self.process_commit(&mut tx, &workspace, repo, channel.id).await? {
                            new_commits = true;
                        }
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(new_commits)
    }

    /// Record the current checkout as a commit row unless it is already
    /// known or its sub-path is untouched; supersede prior commits.
    async fn process_commit<W: RepoWorkspace>(
        &self,
        tx: &mut S::Tx,
        workspace: &W,
        repo: &Repo,
        channel_id: Id,
    ) -> Result<bool, RepoError> {
        let head = workspace.head().await?;

        if tx.commit_exists(repo.id, channel_id, &head.sha).await? {
            info!(sha = short_sha(&head.sha), "commit exists");
            return Ok(false);
        }

        let priors = tx.current_commits(repo.id, channel_id).await?;
        if !repo.path.is_empty() && !priors.is_empty() {
            let mut touched = false;
            for prior in &priors {
                if workspace
                    .has_diff_since(prior.sha.clone(), repo.path.clone())
                    .await?
                {
                    touched = true;
                    break;
                }
            }
            if !touched {
                info!(path = repo.path, "path unchanged since previous commits");
                return Ok(false);
            }
        }

        info!(sha = short_sha(&head.sha), "add commit");
        tx.insert_commit(&NewCommit {
            repo_id: repo.id,
            channel_id,
            sha: head.sha,
            message: head.message,
            user_name: head.user_name,
            user_email: head.user_email,
        })
        .await?;
        for prior in &priors {
            info!(sha = short_sha(&prior.sha), "set commit to old");
            tx.set_commit_status(prior.id, CommitStatus::Old).await?;
        }
        Ok(true)
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(7)]
}

#[async_trait]
impl<S: Store, G: GitSource> Worker for Crawler<S, G> {
    type Payload = CrawlerTask;
    const NAME: &'static str = "crawler";

    async fn work(
        &mut self,
        ctx: &WorkerCtx<CrawlerTask>,
        payload: Option<CrawlerTask>,
    ) -> anyhow::Result<()> {
        let full_scan = match payload {
            Some(CrawlerTask::AllRepos) => true,
            None => std::mem::take(&mut self.periodic),
            Some(CrawlerTask::Update(update)) => {
                if let Err(err) = self.process_update(&update).await {
                    warn!(error = %err, "crawling failed, retry shortly");
                    ctx.reschedule(RETRY_DELAY, Some(CrawlerTask::Update(update)));
                }
                return Ok(());
            }
        };
        if !full_scan {
            return Ok(());
        }

        if let Err(err) = self.process_all_repos().await {
            warn!(error = %err, "crawling failed, retry shortly");
            ctx.reschedule(RETRY_DELAY, Some(CrawlerTask::AllRepos));
            return Ok(());
        }
        ctx.reschedule(CRAWLER_PERIOD, Some(CrawlerTask::AllRepos));
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(dir) = self.data_dir.take() {
            info!(path = %dir.path().display(), "remove crawler data directory");
        }
    }
}
