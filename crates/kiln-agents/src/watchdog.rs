//! Watchdog: re-queues builds whose run has gone silent.
//!
//! A run whose `updated` heartbeat is older than [`STALL_AFTER`] belongs to
//! an agent that died or lost its database connection. The run is marked
//! `stalled`; an `active` build goes back to `new` (and the agents are
//! nudged), a `stopping` build completes its stop as `stopped`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dataplane::bus::Bus;
use dataplane::model::{BuildStatus, Id, RunStatus};
use dataplane::store::{Store, StoreError, StoreTx, RETRY_DELAY};
use tracing::{info, warn};

use crate::worker::{Nudge, Worker, WorkerCtx};

/// Scan interval.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(60);

/// Heartbeat age beyond which a run counts as stalled.
pub const STALL_AFTER: Duration = Duration::from_secs(60);

pub struct Watchdog<S: Store, B: Bus> {
    store: S,
    bus: B,
    agents: Vec<Nudge>,
}

impl<S: Store, B: Bus> Watchdog<S, B> {
    pub fn new(store: S, bus: B, agents: Vec<Nudge>) -> Self {
        Self { store, bus, agents }
    }

    async fn process_stalled_runs(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(STALL_AFTER).expect("fits");
        let mut restarted = false;
        let mut updated: Vec<(Id, Id)> = Vec::new();

        {
            let mut tx = self.store.begin().await?;
            let stalled = tx.stalled_runs(cutoff).await?;
            for run in stalled {
                match run.build_status {
                    BuildStatus::Active => {
                        info!(
                            run_id = run.run_id,
                            build_id = run.build_id,
                            "set run to stalled, reschedule build"
                        );
                        tx.set_run_status(run.run_id, RunStatus::Stalled, Utc::now())
                            .await?;
                        tx.set_build_status(run.build_id, BuildStatus::New).await?;
                        restarted = true;
                        updated.push((run.build_id, run.run_id));
                    }
                    BuildStatus::Stopping => {
                        info!(
                            run_id = run.run_id,
                            build_id = run.build_id,
                            "set run to stalled, stop build"
                        );
                        tx.set_run_status(run.run_id, RunStatus::Stalled, Utc::now())
                            .await?;
                        tx.set_build_status(run.build_id, BuildStatus::Stopped)
                            .await?;
                        updated.push((run.build_id, run.run_id));
                    }
                    _ => {}
                }
            }
            tx.commit().await?;
        }

        for (build_id, run_id) in &updated {
            self.bus.publish_build(*build_id).await;
            self.bus.publish_run(*run_id).await;
        }
        if restarted {
            info!("trigger agents: process builds");
            for agent in &self.agents {
                agent.send();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store, B: Bus> Worker for Watchdog<S, B> {
    type Payload = ();
    const NAME: &'static str = "watchdog";

    async fn work(&mut self, ctx: &WorkerCtx<()>, _payload: Option<()>) -> anyhow::Result<()> {
        match self.process_stalled_runs().await {
            Ok(()) => ctx.reschedule(WATCHDOG_PERIOD, None),
            Err(err) if err.is_transient() => {
                warn!(error = %err, "watchdog pass failed, retry shortly");
                ctx.reschedule(RETRY_DELAY, None);
            }
            Err(err) => {
                ctx.reschedule(WATCHDOG_PERIOD, None);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane::bus::RecordingBus;
    use dataplane::model::{
        Build, Channel, CommitStatus, Configuration, Ecosystem, NewCommit, Platform, Profile,
        Repo, Run,
    };
    use dataplane::store::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Setup {
        store: MemStore,
        bus: RecordingBus,
        nudges: Arc<AtomicUsize>,
        watchdog: Watchdog<MemStore, RecordingBus>,
        build: Build,
    }

    async fn setup(build_status: BuildStatus) -> Setup {
        let store = MemStore::new();
        store
            .seed_configuration(Configuration {
                id: 0,
                ssh_key: String::new(),
                public_ssh_key: String::new(),
                known_hosts: String::new(),
                webhook_secret: String::new(),
                git_credentials: vec![],
                docker_credentials: vec![],
            })
            .await;
        let ecosystem = store
            .seed_ecosystem(Ecosystem {
                id: 0,
                name: "main".into(),
                user: "kiln".into(),
                conan_config_url: String::new(),
                conan_config_path: String::new(),
                conan_config_branch: String::new(),
                conan_credentials: vec![],
            })
            .await;
        let repo = store
            .seed_repo(Repo {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "hello".into(),
                url: "url".into(),
                path: String::new(),
                version: String::new(),
                exclude: vec![],
                options: vec![],
            })
            .await;
        let channel = store
            .seed_channel(Channel {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "stable".into(),
                ref_pattern: "heads/main".into(),
                conan_channel: "stable".into(),
            })
            .await;
        let profile = store
            .seed_profile(Profile {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "linux".into(),
                platform: Platform::Linux,
                container: "kiln/build:latest".into(),
                conan_profile: "linux".into(),
                labels: vec![],
            })
            .await;

        let mut tx = store.begin().await.unwrap();
        let commit = tx
            .insert_commit(&NewCommit {
                repo_id: repo.id,
                channel_id: channel.id,
                sha: "abc".into(),
                message: String::new(),
                user_name: String::new(),
                user_email: String::new(),
            })
            .await
            .unwrap();
        tx.set_commit_status(commit.id, CommitStatus::Building)
            .await
            .unwrap();
        let build = tx
            .insert_build(commit.id, profile.id, Utc::now())
            .await
            .unwrap();
        tx.set_build_status(build.id, build_status).await.unwrap();
        tx.commit().await.unwrap();

        let bus = RecordingBus::new();
        let nudge = Nudge::new();
        let nudges = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&nudges);
        nudge.connect(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let watchdog = Watchdog::new(store.clone(), bus.clone(), vec![nudge.clone(), nudge]);
        Setup {
            store,
            bus,
            nudges,
            watchdog,
            build,
        }
    }

    async fn stale_run(setup: &Setup) -> Run {
        let started = Utc::now() - chrono::Duration::minutes(5);
        let updated = Utc::now() - chrono::Duration::minutes(2);
        setup
            .store
            .seed_run(setup.build.id, started, updated, RunStatus::Active)
            .await
    }

    #[tokio::test]
    async fn stale_active_build_is_rescheduled() {
        let setup = setup(BuildStatus::Active).await;
        let run = stale_run(&setup).await;

        setup.watchdog.process_stalled_runs().await.unwrap();

        let builds = setup.store.all_builds().await;
        assert_eq!(builds[0].status, BuildStatus::New);
        let runs = setup.store.runs_for_build(setup.build.id).await;
        assert_eq!(runs[0].status, RunStatus::Stalled);
        assert_eq!(setup.nudges.load(Ordering::SeqCst), 2, "both agents nudged");
        assert_eq!(setup.bus.on_channel("general").len(), 2);
        let _ = run;
    }

    #[tokio::test]
    async fn stale_stopping_build_completes_the_stop() {
        let setup = setup(BuildStatus::Stopping).await;
        stale_run(&setup).await;

        setup.watchdog.process_stalled_runs().await.unwrap();

        let builds = setup.store.all_builds().await;
        assert_eq!(builds[0].status, BuildStatus::Stopped);
        let runs = setup.store.runs_for_build(setup.build.id).await;
        assert_eq!(runs[0].status, RunStatus::Stalled);
        assert_eq!(setup.nudges.load(Ordering::SeqCst), 0, "no nudge on stop");
    }

    #[tokio::test]
    async fn fresh_runs_are_never_touched() {
        let setup = setup(BuildStatus::Active).await;
        setup
            .store
            .seed_run(setup.build.id, Utc::now(), Utc::now(), RunStatus::Active)
            .await;

        setup.watchdog.process_stalled_runs().await.unwrap();

        let builds = setup.store.all_builds().await;
        assert_eq!(builds[0].status, BuildStatus::Active);
        let runs = setup.store.runs_for_build(setup.build.id).await;
        assert_eq!(runs[0].status, RunStatus::Active);
        assert!(setup.bus.events().is_empty());
    }

    #[tokio::test]
    async fn terminal_builds_with_stale_runs_are_ignored() {
        let setup = setup(BuildStatus::Error).await;
        stale_run(&setup).await;

        setup.watchdog.process_stalled_runs().await.unwrap();

        let builds = setup.store.all_builds().await;
        assert_eq!(builds[0].status, BuildStatus::Error);
    }
}
