//! The `kiln` binary: assembles one deployment role.
//!
//! Each role runs its workers in-process, serves the nudge/webhook HTTP
//! surface, and turns SIGINT/SIGTERM into a cooperative cancel. Peer
//! processes are nudged over HTTP when their base URLs are configured;
//! the `all` role wires every worker directly instead.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dataplane::bus::RedisBus;
use dataplane::config::ProcessConfig;
use dataplane::store::PgStore;

use kiln_agents::agent::Agent;
use kiln_agents::api::{self, ApiState, UpdateNudge};
use kiln_agents::builder::engine::DockerEngine;
use kiln_agents::crawler::{Crawler, CrawlerTask};
use kiln_agents::scheduler::Scheduler;
use kiln_agents::scm::Git2Source;
use kiln_agents::watchdog::Watchdog;
use kiln_agents::worker::{self, Nudge, Worker, WorkerHandle};

#[derive(Parser)]
#[command(name = "kiln", about = "Distributed CI coordination engine")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Scan tracked repositories for new commits.
    Crawler,
    /// Fan new commits out to builds.
    Scheduler,
    /// Lease and execute builds on this host's platform.
    Agent,
    /// Re-queue stalled runs.
    Watchdog,
    /// All workers in one process, nudging each other directly.
    All,
}

/// Everything spawned for one role.
#[derive(Default)]
struct Fleet {
    cancels: Vec<Box<dyn Fn() + Send>>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl Fleet {
    fn add<W: Worker>(&mut self, pair: (WorkerHandle<W>, tokio::task::JoinHandle<()>)) -> WorkerHandle<W> {
        let (handle, join) = pair;
        let cancel_handle = handle.clone();
        self.cancels.push(Box::new(move || cancel_handle.cancel()));
        self.joins.push(join);
        handle
    }

    async fn shutdown(self) {
        for cancel in &self.cancels {
            cancel();
        }
        for join in self.joins {
            let _ = join.await;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match ProcessConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match run(cli.role, config).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "exiting");
            ExitCode::from(1)
        }
    }
}

async fn run(role: Role, config: ProcessConfig) -> anyhow::Result<()> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("store unreachable after retries")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare store schema")?;
    let bus = RedisBus::connect(&config.redis_url).context("invalid bus address")?;

    // Nudge wiring points; per role they end up connected to an in-process
    // worker handle or to a peer's HTTP endpoint.
    let scheduler_nudge = Nudge::new();
    let agent_nudge = Nudge::new();
    let crawler_update = UpdateNudge::new();
    let http = reqwest::Client::new();

    let mut fleet = Fleet::default();
    match role {
        Role::Crawler => {
            let crawler = Crawler::new(store.clone(), Git2Source::new(), scheduler_nudge.clone())?;
            let handle = fleet.add(worker::spawn(crawler));
            connect_crawler(&crawler_update, &handle);
            connect_http(&scheduler_nudge, &http, &config.scheduler_url, "process_commits");
        }
        Role::Scheduler => {
            let agents = remote_agent_nudges(&http, &config);
            let scheduler = Scheduler::new(store.clone(), bus.clone(), agents);
            let handle = fleet.add(worker::spawn(scheduler));
            scheduler_nudge.connect(move || handle.trigger(None));
        }
        Role::Agent => {
            let engine = DockerEngine::connect().map_err(|err| anyhow::anyhow!("{err}"))?;
            let agent = Agent::new(
                store.clone(),
                bus.clone(),
                engine,
                config.agent_platform,
                config.mtu,
                scheduler_nudge.clone(),
            );
            let handle = fleet.add(worker::spawn(agent));
            let agent_handle = handle.clone();
            agent_nudge.connect(move || agent_handle.trigger(None));
            connect_http(&scheduler_nudge, &http, &config.scheduler_url, "process_commits");
        }
        Role::Watchdog => {
            let agents = remote_agent_nudges(&http, &config);
            let watchdog = Watchdog::new(store.clone(), bus.clone(), agents);
            fleet.add(worker::spawn(watchdog));
        }
        Role::All => {
            let crawler = Crawler::new(store.clone(), Git2Source::new(), scheduler_nudge.clone())?;
            let crawler_handle = fleet.add(worker::spawn(crawler));
            connect_crawler(&crawler_update, &crawler_handle);

            let scheduler = Scheduler::new(store.clone(), bus.clone(), vec![agent_nudge.clone()]);
            let scheduler_handle = fleet.add(worker::spawn(scheduler));
            let handle = scheduler_handle.clone();
            scheduler_nudge.connect(move || handle.trigger(None));

            let engine = DockerEngine::connect().map_err(|err| anyhow::anyhow!("{err}"))?;
            let agent = Agent::new(
                store.clone(),
                bus.clone(),
                engine,
                config.agent_platform,
                config.mtu,
                scheduler_nudge.clone(),
            );
            let agent_handle = fleet.add(worker::spawn(agent));
            let handle = agent_handle.clone();
            agent_nudge.connect(move || handle.trigger(None));

            let watchdog = Watchdog::new(store.clone(), bus.clone(), vec![agent_nudge.clone()]);
            fleet.add(worker::spawn(watchdog));
        }
    }

    let shutdown = CancellationToken::new();
    let api_state = ApiState::new(
        store,
        scheduler_nudge.clone(),
        agent_nudge.clone(),
        crawler_update.clone(),
    );
    let http_shutdown = shutdown.clone();
    let http_addr = config.http_addr.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = api::serve(&http_addr, api::router(api_state), http_shutdown).await {
            error!(error = %err, "http surface failed");
        }
    });

    wait_for_signal().await;
    info!("shutting down");
    shutdown.cancel();
    fleet.shutdown().await;
    let _ = server.await;
    Ok(())
}

fn connect_crawler<S, G>(update: &UpdateNudge, handle: &WorkerHandle<Crawler<S, G>>)
where
    S: dataplane::store::Store,
    G: kiln_agents::scm::GitSource,
{
    let handle = handle.clone();
    update.connect(move |repo_update| {
        handle.trigger(Some(CrawlerTask::Update(repo_update)));
    });
}

/// Connect a nudge to a peer's `POST /<endpoint>`; fire-and-forget.
fn connect_http(nudge: &Nudge, client: &reqwest::Client, base: &Option<String>, endpoint: &str) {
    let Some(base) = base else {
        return;
    };
    let url = format!("{}/{endpoint}", base.trim_end_matches('/'));
    let client = client.clone();
    nudge.connect(move || {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).send().await {
                warn!(url, error = %err, "nudge failed");
            }
        });
    });
}

/// One nudge per remote agent platform, skipping unconfigured peers.
fn remote_agent_nudges(client: &reqwest::Client, config: &ProcessConfig) -> Vec<Nudge> {
    let mut agents = Vec::new();
    for base in [&config.linux_agent_url, &config.windows_agent_url] {
        let nudge = Nudge::new();
        connect_http(&nudge, client, base, "process_builds");
        agents.push(nudge);
    }
    agents
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
