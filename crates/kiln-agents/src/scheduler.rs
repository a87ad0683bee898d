//! Scheduler: fans new commits out to builds.
//!
//! One transaction per pass: every `new` commit is crossed with every
//! profile, builds are inserted unless the repo's excluded labels intersect
//! the profile's labels, and the commit flips to `building`. Bus updates go
//! out after commit; agents are nudged whenever `new` builds exist.

use async_trait::async_trait;
use chrono::Utc;
use dataplane::bus::Bus;
use dataplane::model::{CommitStatus, Id};
use dataplane::store::{Store, StoreError, StoreTx, RETRY_DELAY};
use tracing::{info, warn};

use crate::worker::{Nudge, Worker, WorkerCtx};

pub struct Scheduler<S: Store, B: Bus> {
    store: S,
    bus: B,
    agents: Vec<Nudge>,
}

impl<S: Store, B: Bus> Scheduler<S, B> {
    pub fn new(store: S, bus: B, agents: Vec<Nudge>) -> Self {
        Self { store, bus, agents }
    }

    /// One fan-out pass; returns whether any build was scheduled.
    async fn process_commits(&self) -> Result<bool, StoreError> {
        info!("start processing commits");

        let mut scheduled: Vec<Id> = Vec::new();
        let new_builds = {
            let mut tx = self.store.begin().await?;
            let commits = tx.new_commits().await?;
            let profiles = tx.profiles().await?;

            for commit in &commits {
                let repo = tx
                    .repo(commit.repo_id)
                    .await?
                    .ok_or(StoreError::NotFound("repo"))?;
                info!(sha = %&commit.sha[..commit.sha.len().min(7)], url = repo.url, "process commit");

                for profile in &profiles {
                    let excluded = profile
                        .labels
                        .iter()
                        .any(|label| repo.exclude.contains(label));
                    if excluded {
                        info!(profile = profile.name, "exclude build");
                        continue;
                    }
                    info!(profile = profile.name, "schedule build");
                    let build = tx
                        .insert_build(commit.id, profile.id, Utc::now())
                        .await?;
                    scheduled.push(build.id);
                }
                tx.set_commit_status(commit.id, CommitStatus::Building)
                    .await?;
            }

            let new_builds = tx.count_new_builds().await?;
            tx.commit().await?;
            new_builds
        };

        for build_id in &scheduled {
            self.bus.publish_build(*build_id).await;
        }

        info!(new_builds, scheduled = scheduled.len(), "finish processing commits");
        if new_builds > 0 {
            info!("trigger agents: process builds");
            for agent in &self.agents {
                agent.send();
            }
        }
        Ok(!scheduled.is_empty())
    }
}

#[async_trait]
impl<S: Store, B: Bus> Worker for Scheduler<S, B> {
    type Payload = ();
    const NAME: &'static str = "scheduler";

    async fn work(&mut self, ctx: &WorkerCtx<()>, _payload: Option<()>) -> anyhow::Result<()> {
        // Loop immediately while new commits keep arriving.
        loop {
            match self.process_commits().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "processing commits failed, retry shortly");
                    ctx.reschedule(RETRY_DELAY, None);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
