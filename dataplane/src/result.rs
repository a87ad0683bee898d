//! Result manager: reconciles builder output with the recipe / revision /
//! package graph and re-queues failed builds whose missing dependencies were
//! just produced.
//!
//! Both entry points run inside the agent's transaction; retriggered build
//! ids are returned so the caller can publish them after commit.

use tracing::{debug, info, warn};

use crate::model::{BuildStatus, CommitStatus, Id, Package, RecipeRevision};
use crate::output::{parse_recipe_ref, revision_from_recipe_id, BuildOutput, GraphLock};
use crate::store::{StoreResult, StoreTx};

/// What a result-manager pass changed.
#[derive(Debug, Default)]
pub struct ProcessedResult {
    /// Builds transitioned `error → new`; publish and nudge when non-empty.
    pub retriggered: Vec<Id>,
}

impl ProcessedResult {
    pub fn new_builds(&self) -> bool {
        !self.retriggered.is_empty()
    }
}

/// Process the output of a successful build.
pub async fn process_success<T: StoreTx>(
    tx: &mut T,
    build_id: Id,
    ecosystem_id: Id,
    output: &BuildOutput,
) -> StoreResult<ProcessedResult> {
    let mut result = ProcessedResult::default();

    let Some(Ok(create)) = output.parse_create() else {
        warn!(build_id, "successful build has no usable create output");
        return Ok(result);
    };
    let Some(Ok(lock)) = output.parse_lock() else {
        warn!(build_id, "successful build has no usable lock output");
        return Ok(result);
    };

    let Some(build) = tx.build(build_id).await? else {
        warn!(build_id, "build vanished before result processing");
        return Ok(result);
    };
    let commit_building = tx
        .commit_by_id(build.commit_id)
        .await?
        .is_some_and(|commit| commit.status == CommitStatus::Building);

    tx.clear_build_outcome(build_id).await?;

    let mut own_package: Option<Package> = None;
    for entry in &create.installed {
        if entry.recipe.dependency {
            continue;
        }

        let Some(revision_hash) = revision_from_recipe_id(&entry.recipe.id) else {
            warn!(build_id, id = %entry.recipe.id, "invalid recipe reference");
            continue;
        };
        let recipe = tx
            .upsert_recipe(
                ecosystem_id,
                &entry.recipe.name,
                &entry.recipe.version,
                entry.recipe.user.as_deref(),
                entry.recipe.channel.as_deref(),
            )
            .await?;
        let revision = tx.upsert_recipe_revision(recipe.id, &revision_hash).await?;
        if commit_building {
            tx.set_recipe_current_revision(recipe.id, revision.id)
                .await?;
        }

        for package_data in &entry.packages {
            let package = tx.upsert_package(revision.id, &package_data.id).await?;
            tx.set_build_package(build_id, Some(package.id)).await?;
            let waiting = tx.builds_waiting_for_package(&package).await?;
            result.retriggered.extend(retrigger(tx, waiting).await?);
            own_package = Some(package);
        }

        let waiting = tx.builds_waiting_for_recipe(recipe.id).await?;
        result.retriggered.extend(retrigger(tx, waiting).await?);
    }

    match own_package {
        Some(package) => {
            let requires =
                upsert_required_packages(tx, ecosystem_id, &lock.graph_lock).await?;
            tx.set_package_requires(package.id, &requires).await?;
        }
        None => debug!(build_id, "create output lists no own package"),
    }

    result.retriggered.sort_unstable();
    result.retriggered.dedup();
    info!(
        build_id,
        retriggered = result.retriggered.len(),
        "processed successful build"
    );
    Ok(result)
}

/// Process the output of a failed build: record reference data and the
/// missing-dependency links that later successes resolve against.
pub async fn process_failure<T: StoreTx>(
    tx: &mut T,
    build_id: Id,
    ecosystem_id: Id,
    output: &BuildOutput,
) -> StoreResult<ProcessedResult> {
    let result = ProcessedResult::default();

    let Some(Ok(create)) = output.parse_create() else {
        info!(build_id, "failed build has no usable create output");
        return Ok(result);
    };
    let lock = match output.parse_lock() {
        Some(Ok(lock)) => Some(lock),
        _ => {
            info!(build_id, "failed build has no usable lock output");
            None
        }
    };
    if !create.error {
        info!(build_id, "create stage succeeded, no missing dependencies");
    }

    let Some(build) = tx.build(build_id).await? else {
        warn!(build_id, "build vanished before result processing");
        return Ok(result);
    };
    let commit_building = tx
        .commit_by_id(build.commit_id)
        .await?
        .is_some_and(|commit| commit.status == CommitStatus::Building);

    tx.clear_build_outcome(build_id).await?;

    let mut own_package = false;
    for entry in &create.installed {
        let revision_hash = revision_from_recipe_id(&entry.recipe.id);

        // The build's own recipe: reference data only.
        if !entry.recipe.dependency {
            let Some(revision_hash) = revision_hash else {
                warn!(build_id, id = %entry.recipe.id, "invalid recipe reference");
                continue;
            };
            let recipe = tx
                .upsert_recipe(
                    ecosystem_id,
                    &entry.recipe.name,
                    &entry.recipe.version,
                    entry.recipe.user.as_deref(),
                    entry.recipe.channel.as_deref(),
                )
                .await?;
            let revision = tx.upsert_recipe_revision(recipe.id, &revision_hash).await?;
            if commit_building {
                tx.set_recipe_current_revision(recipe.id, revision.id)
                    .await?;
            }
            for package_data in &entry.packages {
                let package = tx.upsert_package(revision.id, &package_data.id).await?;
                if let Some(lock) = &lock {
                    let requires =
                        upsert_required_packages(tx, ecosystem_id, &lock.graph_lock).await?;
                    tx.set_package_requires(package.id, &requires).await?;
                }
                tx.set_build_package(build_id, Some(package.id)).await?;
                own_package = true;
            }
            if !own_package {
                tx.set_build_recipe_revision(build_id, Some(revision.id))
                    .await?;
            }
            continue;
        }

        // A dependency whose recipe itself is missing.
        if entry.recipe.is_missing() {
            let recipe = tx
                .upsert_recipe(
                    ecosystem_id,
                    &entry.recipe.name,
                    &entry.recipe.version,
                    entry.recipe.user.as_deref(),
                    entry.recipe.channel.as_deref(),
                )
                .await?;
            tx.add_missing_recipe(build_id, recipe.id).await?;
            continue;
        }

        // A resolved dependency with missing packages.
        let Some(revision_hash) = revision_hash else {
            warn!(build_id, id = %entry.recipe.id, "invalid recipe reference");
            continue;
        };
        let recipe = tx
            .upsert_recipe(
                ecosystem_id,
                &entry.recipe.name,
                &entry.recipe.version,
                entry.recipe.user.as_deref(),
                entry.recipe.channel.as_deref(),
            )
            .await?;
        let revision = tx.upsert_recipe_revision(recipe.id, &revision_hash).await?;
        for package_data in &entry.packages {
            if package_data.is_missing() {
                let package = tx.upsert_package(revision.id, &package_data.id).await?;
                tx.add_missing_package(build_id, package.id).await?;
            }
        }
    }

    info!(build_id, "processed failed build");
    Ok(result)
}

/// Flip every waiting build back to `new`; returns what was flipped.
async fn retrigger<T: StoreTx>(tx: &mut T, waiting: Vec<Id>) -> StoreResult<Vec<Id>> {
    for build_id in &waiting {
        info!(build_id, "re-queue build with resolved dependency");
        tx.set_build_status(*build_id, BuildStatus::New).await?;
    }
    Ok(waiting)
}

/// Upsert every requirement of the lock's root node transitively and return
/// the package row ids, de-duplicated (which keeps the self-join cycle-free
/// within one resolution pass).
async fn upsert_required_packages<T: StoreTx>(
    tx: &mut T,
    ecosystem_id: Id,
    lock: &GraphLock,
) -> StoreResult<Vec<Id>> {
    let mut requires = Vec::new();
    for node_key in lock.root_requirements() {
        let Some(node) = lock.nodes.get(node_key) else {
            warn!(node_key, "lock root references an unknown node");
            continue;
        };
        let (Some(reference), Some(package_id)) = (node.r#ref.as_deref(), node.package_id.as_deref())
        else {
            warn!(node_key, "lock node lacks ref or package id");
            continue;
        };
        let Some(parsed) = parse_recipe_ref(reference) else {
            warn!(node_key, reference, "invalid recipe reference in lock");
            continue;
        };
        let revision = upsert_reference(tx, ecosystem_id, &parsed).await?;
        let package = tx.upsert_package(revision.id, package_id).await?;
        if !requires.contains(&package.id) {
            requires.push(package.id);
        }
    }
    Ok(requires)
}

async fn upsert_reference<T: StoreTx>(
    tx: &mut T,
    ecosystem_id: Id,
    reference: &crate::output::RecipeRef,
) -> StoreResult<RecipeRevision> {
    let recipe = tx
        .upsert_recipe(
            ecosystem_id,
            &reference.name,
            &reference.version,
            reference.user.as_deref(),
            reference.channel.as_deref(),
        )
        .await?;
    tx.upsert_recipe_revision(recipe.id, &reference.revision)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BuildStatus, Channel, CommitStatus, Configuration, Ecosystem, NewCommit, Platform,
        Profile, Repo,
    };
    use crate::store::{MemStore, Store};
    use chrono::Utc;

    struct Fixture {
        store: MemStore,
        ecosystem_id: Id,
        build_id: Id,
    }

    async fn fixture() -> Fixture {
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
                url: "git@example.com:acme/hello.git".into(),
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
                conan_profile: "default".into(),
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
        tx.commit().await.unwrap();

        Fixture {
            store,
            ecosystem_id: ecosystem.id,
            build_id: build.id,
        }
    }

    fn success_output() -> BuildOutput {
        BuildOutput {
            create: Some(
                r#"{
                    "error": false,
                    "installed": [{
                        "recipe": {
                            "id": "hello/1.0@kiln/stable#r1",
                            "name": "hello",
                            "version": "1.0",
                            "user": "kiln",
                            "channel": "stable",
                            "dependency": false,
                            "error": null
                        },
                        "packages": [{"id": "pkg-hello", "error": null}]
                    }]
                }"#
                .into(),
            ),
            info: Some("{}".into()),
            lock: Some(
                r#"{
                    "graph_lock": {
                        "nodes": {
                            "0": {"requires": ["1"]},
                            "1": {"ref": "zlib/1.3#za", "package_id": "pkg-zlib"}
                        }
                    }
                }"#
                .into(),
            ),
        }
    }

    fn failure_output_missing_package() -> BuildOutput {
        BuildOutput {
            create: Some(
                r#"{
                    "error": true,
                    "installed": [
                        {
                            "recipe": {
                                "id": "consumer/1.0@kiln/stable#c1",
                                "name": "consumer",
                                "version": "1.0",
                                "user": "kiln",
                                "channel": "stable",
                                "dependency": false,
                                "error": null
                            },
                            "packages": []
                        },
                        {
                            "recipe": {
                                "id": "zlib/1.3#za",
                                "name": "zlib",
                                "version": "1.3",
                                "dependency": true,
                                "error": null
                            },
                            "packages": [{"id": "pkg-zlib", "error": {"type": "missing"}}]
                        }
                    ]
                }"#
                .into(),
            ),
            info: None,
            lock: None,
        }
    }

    #[tokio::test]
    async fn success_materializes_graph_and_requirements() {
        let fixture = fixture().await;
        let mut tx = fixture.store.begin().await.unwrap();
        let result = process_success(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &success_output(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert!(!result.new_builds());
        let builds = fixture.store.all_builds().await;
        let build = builds.iter().find(|b| b.id == fixture.build_id).unwrap();
        let package_id = build.package_id.expect("own package recorded");
        let requires = fixture.store.package_requires(package_id).await;
        assert_eq!(requires.len(), 1, "zlib requirement linked");
    }

    #[tokio::test]
    async fn failure_records_missing_packages_and_partial_revision() {
        let fixture = fixture().await;
        let mut tx = fixture.store.begin().await.unwrap();
        let result = process_failure(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &failure_output_missing_package(),
        )
        .await
        .unwrap();
        assert!(!result.new_builds());

        let missing = tx.missing_packages(fixture.build_id).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].package_id, "pkg-zlib");

        let build = tx.build(fixture.build_id).await.unwrap().unwrap();
        assert!(build.package_id.is_none());
        assert!(
            build.recipe_revision_id.is_some(),
            "partial reference data kept"
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn missing_output_is_a_noop() {
        let fixture = fixture().await;
        let mut tx = fixture.store.begin().await.unwrap();
        let empty = BuildOutput::default();
        let success = process_success(&mut tx, fixture.build_id, fixture.ecosystem_id, &empty)
            .await
            .unwrap();
        let failure = process_failure(&mut tx, fixture.build_id, fixture.ecosystem_id, &empty)
            .await
            .unwrap();
        assert!(!success.new_builds());
        assert!(!failure.new_builds());
    }

    #[tokio::test]
    async fn producing_a_missing_package_retriggers_the_waiter() {
        let fixture = fixture().await;

        // The consumer fails on the missing zlib package.
        let mut tx = fixture.store.begin().await.unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Active)
            .await
            .unwrap();
        process_failure(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &failure_output_missing_package(),
        )
        .await
        .unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Error)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // A second build produces exactly that package.
        let mut tx = fixture.store.begin().await.unwrap();
        let producer_output = BuildOutput {
            create: Some(
                r#"{
                    "error": false,
                    "installed": [{
                        "recipe": {
                            "id": "zlib/1.3#za",
                            "name": "zlib",
                            "version": "1.3",
                            "dependency": false,
                            "error": null
                        },
                        "packages": [{"id": "pkg-zlib", "error": null}]
                    }]
                }"#
                .into(),
            ),
            info: None,
            lock: Some(r#"{"graph_lock": {"nodes": {"0": {}}}}"#.into()),
        };
        let result = process_success(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &producer_output,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.retriggered, vec![fixture.build_id]);
        let builds = fixture.store.all_builds().await;
        let waiter = builds.iter().find(|b| b.id == fixture.build_id).unwrap();
        assert_eq!(waiter.status, BuildStatus::New);
    }

    #[tokio::test]
    async fn cross_revision_package_retriggers_the_waiter() {
        let fixture = fixture().await;

        let mut tx = fixture.store.begin().await.unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Active)
            .await
            .unwrap();
        process_failure(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &failure_output_missing_package(),
        )
        .await
        .unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Error)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // zlib rebuilt at a different revision with a different package id.
        let mut tx = fixture.store.begin().await.unwrap();
        let producer_output = BuildOutput {
            create: Some(
                r#"{
                    "error": false,
                    "installed": [{
                        "recipe": {
                            "id": "zlib/1.3#zb",
                            "name": "zlib",
                            "version": "1.3",
                            "dependency": false,
                            "error": null
                        },
                        "packages": [{"id": "pkg-other", "error": null}]
                    }]
                }"#
                .into(),
            ),
            info: None,
            lock: Some(r#"{"graph_lock": {"nodes": {"0": {}}}}"#.into()),
        };
        let result = process_success(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &producer_output,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.retriggered, vec![fixture.build_id]);
    }

    #[tokio::test]
    async fn missing_recipe_retriggers_on_recipe_upsert() {
        let fixture = fixture().await;

        let failure = BuildOutput {
            create: Some(
                r#"{
                    "error": true,
                    "installed": [{
                        "recipe": {
                            "id": "boost/1.84",
                            "name": "boost",
                            "version": "1.84",
                            "dependency": true,
                            "error": {"type": "missing"}
                        },
                        "packages": []
                    }]
                }"#
                .into(),
            ),
            info: None,
            lock: None,
        };
        let mut tx = fixture.store.begin().await.unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Active)
            .await
            .unwrap();
        process_failure(&mut tx, fixture.build_id, fixture.ecosystem_id, &failure)
            .await
            .unwrap();
        tx.set_build_status(fixture.build_id, BuildStatus::Error)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let success = BuildOutput {
            create: Some(
                r#"{
                    "error": false,
                    "installed": [{
                        "recipe": {
                            "id": "boost/1.84#b1",
                            "name": "boost",
                            "version": "1.84",
                            "dependency": false,
                            "error": null
                        },
                        "packages": [{"id": "pkg-boost", "error": null}]
                    }]
                }"#
                .into(),
            ),
            info: None,
            lock: Some(r#"{"graph_lock": {"nodes": {"0": {}}}}"#.into()),
        };
        let mut tx = fixture.store.begin().await.unwrap();
        let result = process_success(
            &mut tx,
            fixture.build_id,
            fixture.ecosystem_id,
            &success,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(result.retriggered, vec![fixture.build_id]);
    }
}
