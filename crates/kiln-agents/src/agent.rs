//! Agent: leases builds for one platform and executes them end to end.
//!
//! The lease (`FOR UPDATE SKIP LOCKED` on the build row) is the sole
//! coordination primitive between concurrent agents. A leased build gets a
//! fresh run, an immutable parameter snapshot, and a [`Builder`] driven
//! under a supervision tick that persists log lines, keeps the run's
//! heartbeat fresh, and watches for an external stop. After a build
//! finishes the agent immediately tries to lease another; it only idles
//! when no lease is available.
//!
//! A store failure mid-build drops the builder (its container is cleaned up
//! best-effort) and leaves the build `active`; the watchdog re-queues it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dataplane::bus::Bus;
use dataplane::model::{BuildStatus, Id, LeasedBuild, Platform, RunStatus};
use dataplane::result;
use dataplane::store::{Store, StoreError, StoreTx, RETRY_DELAY};
use tracing::{error, info, warn};

use crate::builder::engine::ContainerEngine;
use crate::builder::{BuildParameters, Builder};
use crate::worker::{Nudge, Worker, WorkerCtx};

/// Supervision tick while a build runs.
pub const SUPERVISION_TICK: Duration = Duration::from_secs(10);

struct CurrentBuild {
    build_id: Id,
    run_id: Id,
}

pub struct Agent<S: Store, B: Bus, E: ContainerEngine> {
    store: S,
    bus: B,
    engine: E,
    platform: Platform,
    mtu: u32,
    scheduler: Nudge,
    tick: Duration,
    current: Option<CurrentBuild>,
}

impl<S: Store, B: Bus, E: ContainerEngine> Agent<S, B, E> {
    pub fn new(store: S, bus: B, engine: E, platform: Platform, mtu: u32, scheduler: Nudge) -> Self {
        Self {
            store,
            bus,
            engine,
            platform,
            mtu,
            scheduler,
            tick: SUPERVISION_TICK,
            current: None,
        }
    }

    /// Shorten the supervision tick; tests use this to observe stop
    /// handling without waiting out the production interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Lease and execute one build; returns whether a build was processed.
    async fn process_builds(&mut self) -> Result<bool, StoreError> {
        info!(platform = %self.platform, "start processing builds");

        let lease = {
            let mut tx = self.store.begin().await?;
            let lease = tx.lease_build(self.platform, Utc::now()).await?;
            tx.commit().await?;
            lease
        };
        let Some(lease) = lease else {
            info!("stop processing builds with no builds processed");
            return Ok(false);
        };

        let build_id = lease.build.id;
        let run_id = lease.run_id;
        info!(build_id, run_id, "set status of build to active");
        self.current = Some(CurrentBuild { build_id, run_id });
        self.bus.publish_build(build_id).await;
        self.bus.publish_run(run_id).await;

        let parameters = BuildParameters::from_lease(&lease, self.mtu);
        let builder = Arc::new(Builder::new(
            self.engine.clone(),
            self.platform,
            lease.profile.container.clone(),
        ));

        let outcome = self.supervise(&lease, &builder, &parameters).await;
        builder.teardown().await;
        // On a store error the build stays `active` and the watchdog
        // re-queues it; only a dropped-in-flight iteration keeps `current`
        // for the cleanup hook.
        self.current = None;
        outcome.map(|()| true)
    }

    /// Drive the builder phases under the supervision tick.
    async fn supervise(
        &mut self,
        lease: &LeasedBuild,
        builder: &Arc<Builder<E>>,
        parameters: &BuildParameters,
    ) -> Result<(), StoreError> {
        let build_id = lease.build.id;
        let run_id = lease.run_id;

        let phases = builder.run_phases(parameters);
        tokio::pin!(phases);
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.reset();

        let result = loop {
            tokio::select! {
                result = &mut phases => break result,
                _ = tick.tick() => {
                    self.persist_logs(run_id, builder).await?;
                    if self.check_stop(build_id, run_id, builder).await? {
                        return Ok(());
                    }
                }
            }
        };
        self.persist_logs(run_id, builder).await?;

        // The stop may have landed between the last tick and completion.
        if self.check_stop(build_id, run_id, builder).await? {
            return Ok(());
        }

        match result {
            Ok(()) => {
                info!(build_id, "process build output");
                let retriggered = {
                    let mut tx = self.store.begin().await?;
                    let processed = result::process_success(
                        &mut tx,
                        build_id,
                        lease.ecosystem.id,
                        &builder.build_output(),
                    )
                    .await?;
                    tx.set_build_status(build_id, BuildStatus::Success).await?;
                    tx.set_run_status(run_id, RunStatus::Success, Utc::now())
                        .await?;
                    tx.commit().await?;
                    processed.retriggered
                };
                info!(build_id, "set status of build to success");
                self.bus.publish_build(build_id).await;
                self.bus.publish_run(run_id).await;
                for retriggered_id in &retriggered {
                    self.bus.publish_build(*retriggered_id).await;
                }
                if !retriggered.is_empty() {
                    info!("trigger scheduler: process commits");
                    self.scheduler.send();
                }
            }
            Err(failure) => {
                info!(build_id, error = %failure, "build failed");
                let mut tx = self.store.begin().await?;
                result::process_failure(
                    &mut tx,
                    build_id,
                    lease.ecosystem.id,
                    &builder.build_output(),
                )
                .await?;
                tx.set_build_status(build_id, BuildStatus::Error).await?;
                tx.set_run_status(run_id, RunStatus::Error, Utc::now())
                    .await?;
                let lines = tx
                    .append_log_lines(run_id, &[failure.to_string()], Utc::now())
                    .await?;
                tx.commit().await?;
                info!(build_id, "set status of build to error");
                self.bus.publish_build(build_id).await;
                self.bus.publish_run(run_id).await;
                for line in &lines {
                    self.bus.publish_log_line(run_id, line.id).await;
                }
            }
        }
        Ok(())
    }

    /// Persist drained log lines with dense numbering; an empty tick still
    /// advances the run heartbeat so the watchdog sees a live run.
    async fn persist_logs(&self, run_id: Id, builder: &Builder<E>) -> Result<(), StoreError> {
        let lines = builder.drain_log_lines();
        let mut tx = self.store.begin().await?;
        let inserted = if lines.is_empty() {
            tx.set_run_status(run_id, RunStatus::Active, Utc::now())
                .await?;
            Vec::new()
        } else {
            tx.append_log_lines(run_id, &lines, Utc::now()).await?
        };
        tx.commit().await?;
        for line in &inserted {
            self.bus.publish_log_line(run_id, line.id).await;
        }
        Ok(())
    }

    /// If the build was externally set to `stopping`, cancel the builder
    /// and finalize both rows as `stopped`.
    async fn check_stop(
        &mut self,
        build_id: Id,
        run_id: Id,
        builder: &Builder<E>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(build) = tx.build_for_update(build_id).await? else {
            return Ok(false);
        };
        if build.status != BuildStatus::Stopping {
            return Ok(false);
        }

        info!(build_id, "cancel build");
        builder.cancel();
        info!(build_id, "set status of build to stopped");
        tx.set_build_status(build_id, BuildStatus::Stopped).await?;
        tx.set_run_status(run_id, RunStatus::Stopped, Utc::now())
            .await?;
        tx.commit().await?;
        self.bus.publish_build(build_id).await;
        self.bus.publish_run(run_id).await;
        self.current = None;
        Ok(true)
    }

    /// Revert an in-flight build so a restart picks it up again.
    async fn revert_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        info!(
            build_id = current.build_id,
            "set status of interrupted build back to new"
        );
        let result: Result<(), StoreError> = async {
            let mut tx = self.store.begin().await?;
            tx.set_build_status(current.build_id, BuildStatus::New)
                .await?;
            tx.set_run_status(current.run_id, RunStatus::Stopped, Utc::now())
                .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.bus.publish_build(current.build_id).await;
                self.bus.publish_run(current.run_id).await;
            }
            Err(err) => error!(error = %err, "failed to revert interrupted build"),
        }
    }
}

#[async_trait]
impl<S: Store, B: Bus, E: ContainerEngine> Worker for Agent<S, B, E> {
    type Payload = ();
    const NAME: &'static str = "agent";

    async fn work(&mut self, ctx: &WorkerCtx<()>, _payload: Option<()>) -> anyhow::Result<()> {
        loop {
            match self.process_builds().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "processing builds failed, retry shortly");
                    ctx.reschedule(RETRY_DELAY, None);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.revert_current().await;
    }
}
