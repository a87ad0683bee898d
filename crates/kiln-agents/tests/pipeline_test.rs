//! End-to-end scenarios over the in-memory store and scripted git/container
//! fakes: real workers, real nudge wiring, no external services.

use std::time::Duration;

use dataplane::bus::RecordingBus;
use dataplane::model::{
    BuildStatus, Channel, CommitStatus, Configuration, Ecosystem, Platform, Profile, Repo,
    RunStatus,
};
use dataplane::output::BuildOutput;
use dataplane::store::MemStore;

use kiln_agents::agent::Agent;
use kiln_agents::api::{self, ApiState, UpdateNudge};
use kiln_agents::builder::archive::pack_output_archive;
use kiln_agents::builder::engine::testing::{FakeContainer, FakeEngine};
use kiln_agents::crawler::Crawler;
use kiln_agents::scheduler::Scheduler;
use kiln_agents::scm::testing::{FakeGitSource, FakeRef, FakeRepoState};
use kiln_agents::scm::CommitInfo;
use kiln_agents::worker::{self, Nudge};

const WAIT: Duration = Duration::from_secs(10);

struct Pipeline {
    store: MemStore,
    bus: RecordingBus,
    git: FakeGitSource,
    engine: FakeEngine,
    ecosystem: Ecosystem,
}

impl Pipeline {
    async fn new() -> Self {
        let store = MemStore::new();
        store
            .seed_configuration(Configuration {
                id: 0,
                ssh_key: String::new(),
                public_ssh_key: String::new(),
                known_hosts: String::new(),
                webhook_secret: "hook-secret".into(),
                git_credentials: vec![],
                docker_credentials: vec![],
            })
            .await;
        let ecosystem = store
            .seed_ecosystem(Ecosystem {
                id: 0,
                name: "main".into(),
                user: "kiln".into(),
                conan_config_url: "https://example.com/config.git".into(),
                conan_config_path: String::new(),
                conan_config_branch: String::new(),
                conan_credentials: vec![],
            })
            .await;
        Self {
            store,
            bus: RecordingBus::new(),
            git: FakeGitSource::new(),
            engine: FakeEngine::new(FakeContainer::default()),
            ecosystem,
        }
    }

    async fn seed_repo(&self, name: &str, url: &str) -> Repo {
        self.store
            .seed_repo(Repo {
                id: 0,
                ecosystem_id: self.ecosystem.id,
                name: name.into(),
                url: url.into(),
                path: String::new(),
                version: String::new(),
                exclude: vec![],
                options: vec![],
            })
            .await
    }

    async fn seed_channel(&self, pattern: &str) -> Channel {
        self.store
            .seed_channel(Channel {
                id: 0,
                ecosystem_id: self.ecosystem.id,
                name: "stable".into(),
                ref_pattern: pattern.into(),
                conan_channel: "stable".into(),
            })
            .await
    }

    async fn seed_profile(&self, name: &str, platform: Platform, labels: &[&str]) -> Profile {
        self.store
            .seed_profile(Profile {
                id: 0,
                ecosystem_id: self.ecosystem.id,
                name: name.into(),
                platform,
                container: "kiln/build:latest".into(),
                conan_profile: name.into(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            })
            .await
    }
}

fn head(sha: &str) -> CommitInfo {
    CommitInfo {
        sha: sha.into(),
        message: format!("commit {sha}"),
        user_name: "dev".into(),
        user_email: "dev@example.com".into(),
    }
}

fn success_container(recipe_id: &str, name: &str, version: &str, package: &str) -> FakeContainer {
    FakeContainer {
        log_lines: vec!["fetching sources".into(), "conan create".into()],
        hold_logs: false,
        exit_code: 0,
        output_archive: pack_output_archive(&BuildOutput {
            create: Some(format!(
                r#"{{
                    "error": false,
                    "installed": [{{
                        "recipe": {{
                            "id": "{recipe_id}",
                            "name": "{name}",
                            "version": "{version}",
                            "user": "kiln",
                            "channel": "stable",
                            "dependency": false,
                            "error": null
                        }},
                        "packages": [{{"id": "{package}", "error": null}}]
                    }}]
                }}"#
            )),
            info: Some("{}".into()),
            lock: Some(r#"{"graph_lock": {"nodes": {"0": {}}}}"#.into()),
        }),
    }
}

fn missing_dependency_container(dependency: &str, package: &str) -> FakeContainer {
    FakeContainer {
        log_lines: vec!["resolving dependencies".into()],
        hold_logs: false,
        exit_code: 1,
        output_archive: pack_output_archive(&BuildOutput {
            create: Some(format!(
                r#"{{
                    "error": true,
                    "installed": [
                        {{
                            "recipe": {{
                                "id": "consumer/1.0@kiln/stable#c1",
                                "name": "consumer",
                                "version": "1.0",
                                "user": "kiln",
                                "channel": "stable",
                                "dependency": false,
                                "error": null
                            }},
                            "packages": []
                        }},
                        {{
                            "recipe": {{
                                "id": "{dependency}",
                                "name": "zlib",
                                "version": "1.3",
                                "dependency": true,
                                "error": null
                            }},
                            "packages": [{{"id": "{package}", "error": {{"type": "missing"}}}}]
                        }}
                    ]
                }}"#
            )),
            info: None,
            lock: None,
        }),
    }
}

/// Spawn agent, scheduler and crawler with the in-process nudge chain, in
/// dependency order so no early nudge is lost.
struct Workers {
    crawler: worker::WorkerHandle<Crawler<MemStore, FakeGitSource>>,
    cancels: Vec<Box<dyn Fn() + Send>>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

async fn spawn_workers(pipeline: &Pipeline) -> Workers {
    let scheduler_nudge = Nudge::new();
    let agent_nudge = Nudge::new();

    let agent = Agent::new(
        pipeline.store.clone(),
        pipeline.bus.clone(),
        pipeline.engine.clone(),
        Platform::Linux,
        1500,
        scheduler_nudge.clone(),
    )
    .with_tick(Duration::from_millis(20));
    let (agent_handle, agent_join) = worker::spawn(agent);
    let handle = agent_handle.clone();
    agent_nudge.connect(move || handle.trigger(None));

    let scheduler = Scheduler::new(
        pipeline.store.clone(),
        pipeline.bus.clone(),
        vec![agent_nudge.clone()],
    );
    let (scheduler_handle, scheduler_join) = worker::spawn(scheduler);
    let handle = scheduler_handle.clone();
    scheduler_nudge.connect(move || handle.trigger(None));

    let crawler = Crawler::new(
        pipeline.store.clone(),
        pipeline.git.clone(),
        scheduler_nudge.clone(),
    )
    .expect("crawler data directory");
    let (crawler_handle, crawler_join) = worker::spawn(crawler);

    let cancel_agent = agent_handle.clone();
    let cancel_scheduler = scheduler_handle.clone();
    let cancel_crawler = crawler_handle.clone();
    Workers {
        crawler: crawler_handle,
        cancels: vec![
            Box::new(move || cancel_agent.cancel()),
            Box::new(move || cancel_scheduler.cancel()),
            Box::new(move || cancel_crawler.cancel()),
        ],
        joins: vec![agent_join, scheduler_join, crawler_join],
    }
}

impl Workers {
    async fn shutdown(self) {
        for cancel in &self.cancels {
            cancel();
        }
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn hello_world_build_flows_from_commit_to_success() {
    let pipeline = Pipeline::new().await;
    let repo = pipeline
        .seed_repo("hello", "git@example.com:acme/hello.git")
        .await;
    pipeline.seed_channel("heads/main").await;
    pipeline.seed_profile("linux-gcc", Platform::Linux, &[]).await;

    pipeline.git.put_repo(
        &repo.url,
        FakeRepoState {
            refs: vec![FakeRef {
                normalized: "heads/main".into(),
                head: head("abc123"),
            }],
            ..Default::default()
        },
    );
    pipeline
        .engine
        .set_container(success_container("hello/1.0@kiln/stable#r1", "hello", "1.0", "pkg-hello"));

    let workers = spawn_workers(&pipeline).await;

    let store = pipeline.store.clone();
    let done = wait_until(|| {
        let store = store.clone();
        async move {
            store
                .all_builds()
                .await
                .first()
                .is_some_and(|build| build.status == BuildStatus::Success)
        }
    })
    .await;
    assert!(done, "build reached success");

    let commits = pipeline.store.all_commits().await;
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].status, CommitStatus::Building);

    let builds = pipeline.store.all_builds().await;
    assert_eq!(builds.len(), 1);
    assert!(builds[0].package_id.is_some(), "own package recorded");

    let runs = pipeline.store.runs_for_build(builds[0].id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);

    let log_lines = pipeline.store.log_lines_for_run(runs[0].id).await;
    assert!(!log_lines.is_empty());
    let numbers: Vec<i64> = log_lines.iter().map(|line| line.number).collect();
    let expected: Vec<i64> = (1..=numbers.len() as i64).collect();
    assert_eq!(numbers, expected, "log numbering is dense");

    workers.shutdown().await;
}

#[tokio::test]
async fn missing_dependency_build_is_retriggered_when_satisfied() {
    let pipeline = Pipeline::new().await;
    let consumer = pipeline
        .seed_repo("consumer", "git@example.com:acme/consumer.git")
        .await;
    let library = pipeline
        .seed_repo("zlib", "git@example.com:acme/zlib.git")
        .await;
    pipeline.seed_channel("heads/main").await;
    pipeline.seed_profile("linux-gcc", Platform::Linux, &[]).await;

    // Only the consumer exists at first; its build fails on missing zlib.
    pipeline.git.put_repo(
        &consumer.url,
        FakeRepoState {
            refs: vec![FakeRef {
                normalized: "heads/main".into(),
                head: head("c0ffee1"),
            }],
            ..Default::default()
        },
    );
    pipeline.git.put_repo(&library.url, FakeRepoState::default());
    pipeline
        .engine
        .set_container(missing_dependency_container("zlib/1.3#za", "pkg-zlib"));

    let workers = spawn_workers(&pipeline).await;

    let store = pipeline.store.clone();
    let failed = wait_until(|| {
        let store = store.clone();
        async move {
            store
                .all_builds()
                .await
                .iter()
                .any(|build| build.status == BuildStatus::Error)
        }
    })
    .await;
    assert!(failed, "consumer build failed on the missing package");
    let consumer_build = pipeline.store.all_builds().await[0].clone();

    // Now the library appears and its build produces exactly that package.
    pipeline
        .engine
        .set_container(success_container("zlib/1.3#za", "zlib", "1.3", "pkg-zlib"));
    pipeline.git.put_repo(
        &library.url,
        FakeRepoState {
            refs: vec![FakeRef {
                normalized: "heads/main".into(),
                head: head("11bb22"),
            }],
            ..Default::default()
        },
    );
    workers.crawler.trigger(Some(kiln_agents::crawler::CrawlerTask::AllRepos));

    // The library build succeeds and the consumer is re-queued; the agent
    // then picks the consumer up again and it succeeds as well.
    let store = pipeline.store.clone();
    let consumer_id = consumer_build.id;
    let requeued = wait_until(|| {
        let store = store.clone();
        async move {
            store
                .all_builds()
                .await
                .iter()
                .filter(|build| build.id != consumer_id)
                .any(|build| build.status == BuildStatus::Success)
        }
    })
    .await;
    assert!(requeued, "library build succeeded");

    pipeline.engine.set_container(success_container(
        "consumer/1.0@kiln/stable#c2",
        "consumer",
        "1.0",
        "pkg-consumer",
    ));
    let store = pipeline.store.clone();
    let recovered = wait_until(|| {
        let store = store.clone();
        async move {
            store
                .all_builds()
                .await
                .iter()
                .find(|build| build.id == consumer_id)
                .is_some_and(|build| build.status == BuildStatus::Success)
        }
    })
    .await;
    assert!(recovered, "consumer build ran again and succeeded");

    let runs = pipeline.store.runs_for_build(consumer_id).await;
    assert!(runs.len() >= 2, "the consumer was executed twice");

    workers.shutdown().await;
}

#[tokio::test]
async fn excluded_profile_gets_no_build() {
    let pipeline = Pipeline::new().await;
    let repo = pipeline
        .store
        .seed_repo(Repo {
            id: 0,
            ecosystem_id: pipeline.ecosystem.id,
            name: "native-only".into(),
            url: "git@example.com:acme/native-only.git".into(),
            path: String::new(),
            version: String::new(),
            exclude: vec!["windows".into()],
            options: vec![],
        })
        .await;
    pipeline.seed_channel("heads/main").await;
    pipeline.seed_profile("linux-gcc", Platform::Linux, &[]).await;
    pipeline
        .seed_profile("windows-msvc", Platform::Windows, &["windows"])
        .await;

    pipeline.git.put_repo(
        &repo.url,
        FakeRepoState {
            refs: vec![FakeRef {
                normalized: "heads/main".into(),
                head: head("abc123"),
            }],
            ..Default::default()
        },
    );
    pipeline
        .engine
        .set_container(success_container("native/1.0@kiln/stable#n1", "native", "1.0", "pkg"));

    let workers = spawn_workers(&pipeline).await;

    let store = pipeline.store.clone();
    let scheduled = wait_until(|| {
        let store = store.clone();
        async move { !store.all_builds().await.is_empty() }
    })
    .await;
    assert!(scheduled);
    // Give the scheduler a moment to (wrongly) add more builds.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        pipeline.store.all_builds().await.len(),
        1,
        "only the linux profile built"
    );

    workers.shutdown().await;
}

#[tokio::test]
async fn signed_webhook_creates_exactly_one_commit() {
    let pipeline = Pipeline::new().await;
    let repo = pipeline
        .seed_repo("x", "git@github.com:acme/x.git")
        .await;
    pipeline.seed_channel("heads/main").await;

    // The ref name does not match the channel pattern, so the crawler's
    // initial full scan finds nothing; only the webhook's exact (sha, ref)
    // pair gets the commit in.
    pipeline.git.put_repo(
        &repo.url,
        FakeRepoState {
            refs: vec![FakeRef {
                normalized: "heads/feature".into(),
                head: head("abc999"),
            }],
            ..Default::default()
        },
    );

    let scheduler_nudge = Nudge::new();
    let crawler = Crawler::new(
        pipeline.store.clone(),
        pipeline.git.clone(),
        scheduler_nudge.clone(),
    )
    .unwrap();
    let (crawler_handle, crawler_join) = worker::spawn(crawler);

    let crawler_update = UpdateNudge::new();
    let handle = crawler_handle.clone();
    crawler_update.connect(move |update| {
        handle.trigger(Some(kiln_agents::crawler::CrawlerTask::Update(update)));
    });
    let state = ApiState::new(
        pipeline.store.clone(),
        scheduler_nudge,
        Nudge::new(),
        crawler_update,
    );
    let router = api::router(state);

    let body =
        r#"{"after": "abc999", "ref": "refs/heads/main", "repository": {"full_name": "acme/x"}}"#;
    let signature = api::sign_payload("hook-secret", body.as_bytes());

    use tower::util::ServiceExt;
    let response = router
        .oneshot(
            axum::http::Request::post("/webhook/push")
                .header("x-hub-signature-256", signature)
                .body(axum::body::Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let store = pipeline.store.clone();
    let crawled = wait_until(|| {
        let store = store.clone();
        async move { store.all_commits().await.len() == 1 }
    })
    .await;
    assert!(crawled, "webhook produced exactly one commit");
    let commits = pipeline.store.all_commits().await;
    assert_eq!(commits[0].sha, "abc999");
    assert_eq!(commits[0].status, CommitStatus::New);

    crawler_handle.cancel();
    let _ = crawler_join.await;
}
