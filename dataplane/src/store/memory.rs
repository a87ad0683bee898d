//! In-memory store used by tests and single-process demos.
//!
//! Transactions take ownership of the one state lock for their whole
//! lifetime, so they are fully serialized: a `lease_build` can never observe
//! a row another transaction holds, which is the property the PostgreSQL
//! implementation gets from `FOR UPDATE SKIP LOCKED`. Writes apply
//! immediately; rollback of an abandoned transaction is not simulated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{
    Build, BuildStatus, Channel, Commit, CommitStatus, Configuration, Ecosystem, Id, LeasedBuild,
    LogLine, NewCommit, Package, Platform, Profile, Recipe, RecipeRevision, Repo, Run, RunStatus,
    StalledRun,
};
use crate::store::{clip_log_content, Store, StoreError, StoreResult, StoreTx};

#[derive(Debug, Default)]
struct MemState {
    next_id: Id,
    configuration: Option<Configuration>,
    ecosystems: BTreeMap<Id, Ecosystem>,
    repos: BTreeMap<Id, Repo>,
    channels: BTreeMap<Id, Channel>,
    profiles: BTreeMap<Id, Profile>,
    commits: BTreeMap<Id, Commit>,
    builds: BTreeMap<Id, Build>,
    runs: BTreeMap<Id, Run>,
    log_lines: BTreeMap<Id, LogLine>,
    recipes: BTreeMap<Id, Recipe>,
    revisions: BTreeMap<Id, RecipeRevision>,
    packages: BTreeMap<Id, Package>,
    missing_recipe: BTreeSet<(Id, Id)>,
    missing_package: BTreeSet<(Id, Id)>,
    package_requirement: BTreeSet<(Id, Id)>,
}

impl MemState {
    fn allocate(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared in-memory store; cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the configuration singleton (id is assigned).
    pub async fn seed_configuration(&self, mut configuration: Configuration) -> Configuration {
        let mut state = self.state.lock().await;
        configuration.id = state.allocate();
        state.configuration = Some(configuration.clone());
        configuration
    }

    pub async fn seed_ecosystem(&self, mut ecosystem: Ecosystem) -> Ecosystem {
        let mut state = self.state.lock().await;
        ecosystem.id = state.allocate();
        state.ecosystems.insert(ecosystem.id, ecosystem.clone());
        ecosystem
    }

    pub async fn seed_repo(&self, mut repo: Repo) -> Repo {
        let mut state = self.state.lock().await;
        repo.id = state.allocate();
        state.repos.insert(repo.id, repo.clone());
        repo
    }

    pub async fn seed_channel(&self, mut channel: Channel) -> Channel {
        let mut state = self.state.lock().await;
        channel.id = state.allocate();
        state.channels.insert(channel.id, channel.clone());
        channel
    }

    pub async fn seed_profile(&self, mut profile: Profile) -> Profile {
        let mut state = self.state.lock().await;
        profile.id = state.allocate();
        state.profiles.insert(profile.id, profile.clone());
        profile
    }

    /// Insert a run row directly; watchdog tests use this to backdate
    /// `updated`.
    pub async fn seed_run(
        &self,
        build_id: Id,
        started: DateTime<Utc>,
        updated: DateTime<Utc>,
        status: RunStatus,
    ) -> Run {
        let mut state = self.state.lock().await;
        let run = Run {
            id: state.allocate(),
            build_id,
            started,
            updated,
            status,
        };
        state.runs.insert(run.id, run.clone());
        run
    }

    // Inspection helpers for assertions.

    pub async fn all_builds(&self) -> Vec<Build> {
        self.state.lock().await.builds.values().cloned().collect()
    }

    pub async fn all_commits(&self) -> Vec<Commit> {
        self.state.lock().await.commits.values().cloned().collect()
    }

    pub async fn runs_for_build(&self, build_id: Id) -> Vec<Run> {
        self.state
            .lock()
            .await
            .runs
            .values()
            .filter(|run| run.build_id == build_id)
            .cloned()
            .collect()
    }

    pub async fn log_lines_for_run(&self, run_id: Id) -> Vec<LogLine> {
        self.state
            .lock()
            .await
            .log_lines
            .values()
            .filter(|line| line.run_id == run_id)
            .cloned()
            .collect()
    }

    pub async fn package_requires(&self, package_id: Id) -> Vec<Id> {
        self.state
            .lock()
            .await
            .package_requirement
            .iter()
            .filter(|(package, _)| *package == package_id)
            .map(|(_, requirement)| *requirement)
            .collect()
    }
}

/// One serialized transaction over the in-memory tables.
pub struct MemTx {
    state: OwnedMutexGuard<MemState>,
}

#[async_trait]
impl Store for MemStore {
    type Tx = MemTx;

    async fn begin(&self) -> StoreResult<MemTx> {
        Ok(MemTx {
            state: self.state.clone().lock_owned().await,
        })
    }
}

impl MemTx {
    fn leased_build_context(&self, build: &Build, run_id: Id) -> StoreResult<LeasedBuild> {
        let state = &self.state;
        let commit = state
            .commits
            .get(&build.commit_id)
            .ok_or(StoreError::NotFound("commit"))?;
        let repo = state
            .repos
            .get(&commit.repo_id)
            .ok_or(StoreError::NotFound("repo"))?;
        let channel = state
            .channels
            .get(&commit.channel_id)
            .ok_or(StoreError::NotFound("channel"))?;
        let profile = state
            .profiles
            .get(&build.profile_id)
            .ok_or(StoreError::NotFound("profile"))?;
        let ecosystem = state
            .ecosystems
            .get(&profile.ecosystem_id)
            .ok_or(StoreError::NotFound("ecosystem"))?;
        let configuration = state
            .configuration
            .clone()
            .ok_or(StoreError::NotFound("configuration"))?;
        Ok(LeasedBuild {
            build: build.clone(),
            run_id,
            commit: commit.clone(),
            repo: repo.clone(),
            channel: channel.clone(),
            profile: profile.clone(),
            ecosystem: ecosystem.clone(),
            configuration,
        })
    }
}

#[async_trait]
impl StoreTx for MemTx {
    async fn commit(self) -> StoreResult<()> {
        Ok(())
    }

    async fn configuration(&mut self) -> StoreResult<Configuration> {
        self.state
            .configuration
            .clone()
            .ok_or(StoreError::NotFound("configuration"))
    }

    async fn ecosystem(&mut self, id: Id) -> StoreResult<Option<Ecosystem>> {
        Ok(self.state.ecosystems.get(&id).cloned())
    }

    async fn repos(&mut self) -> StoreResult<Vec<Repo>> {
        Ok(self.state.repos.values().cloned().collect())
    }

    async fn repo(&mut self, id: Id) -> StoreResult<Option<Repo>> {
        Ok(self.state.repos.get(&id).cloned())
    }

    async fn channels(&mut self, ecosystem_id: Id) -> StoreResult<Vec<Channel>> {
        Ok(self
            .state
            .channels
            .values()
            .filter(|channel| channel.ecosystem_id == ecosystem_id)
            .cloned()
            .collect())
    }

    async fn profiles(&mut self) -> StoreResult<Vec<Profile>> {
        Ok(self.state.profiles.values().cloned().collect())
    }

    async fn commit_exists(
        &mut self,
        repo_id: Id,
        channel_id: Id,
        sha: &str,
    ) -> StoreResult<bool> {
        Ok(self.state.commits.values().any(|commit| {
            commit.repo_id == repo_id && commit.channel_id == channel_id && commit.sha == sha
        }))
    }

    async fn current_commits(&mut self, repo_id: Id, channel_id: Id) -> StoreResult<Vec<Commit>> {
        Ok(self
            .state
            .commits
            .values()
            .filter(|commit| {
                commit.repo_id == repo_id
                    && commit.channel_id == channel_id
                    && commit.status != CommitStatus::Old
            })
            .cloned()
            .collect())
    }

    async fn insert_commit(&mut self, commit: &NewCommit) -> StoreResult<Commit> {
        let row = Commit {
            id: self.state.allocate(),
            repo_id: commit.repo_id,
            channel_id: commit.channel_id,
            sha: commit.sha.clone(),
            message: commit.message.clone(),
            user_name: commit.user_name.clone(),
            user_email: commit.user_email.clone(),
            status: CommitStatus::New,
        };
        self.state.commits.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_commit_status(&mut self, commit_id: Id, status: CommitStatus) -> StoreResult<()> {
        let commit = self
            .state
            .commits
            .get_mut(&commit_id)
            .ok_or(StoreError::NotFound("commit"))?;
        commit.status = status;
        Ok(())
    }

    async fn new_commits(&mut self) -> StoreResult<Vec<Commit>> {
        Ok(self
            .state
            .commits
            .values()
            .filter(|commit| commit.status == CommitStatus::New)
            .cloned()
            .collect())
    }

    async fn commit_by_id(&mut self, id: Id) -> StoreResult<Option<Commit>> {
        Ok(self.state.commits.get(&id).cloned())
    }

    async fn insert_build(
        &mut self,
        commit_id: Id,
        profile_id: Id,
        created: DateTime<Utc>,
    ) -> StoreResult<Build> {
        let build = Build {
            id: self.state.allocate(),
            commit_id,
            profile_id,
            created,
            status: BuildStatus::New,
            package_id: None,
            recipe_revision_id: None,
        };
        self.state.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn count_new_builds(&mut self) -> StoreResult<i64> {
        Ok(self
            .state
            .builds
            .values()
            .filter(|build| build.status == BuildStatus::New)
            .count() as i64)
    }

    async fn lease_build(
        &mut self,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeasedBuild>> {
        let candidate = self
            .state
            .builds
            .values()
            .filter(|build| build.status == BuildStatus::New)
            .filter(|build| {
                self.state
                    .profiles
                    .get(&build.profile_id)
                    .is_some_and(|profile| profile.platform == platform)
            })
            .map(|build| build.id)
            .next();

        let Some(build_id) = candidate else {
            return Ok(None);
        };

        let build = {
            let build = self
                .state
                .builds
                .get_mut(&build_id)
                .ok_or(StoreError::NotFound("build"))?;
            build.status = BuildStatus::Active;
            build.clone()
        };
        let run = Run {
            id: self.state.allocate(),
            build_id,
            started: now,
            updated: now,
            status: RunStatus::Active,
        };
        self.state.runs.insert(run.id, run.clone());
        self.leased_build_context(&build, run.id).map(Some)
    }

    async fn build(&mut self, id: Id) -> StoreResult<Option<Build>> {
        Ok(self.state.builds.get(&id).cloned())
    }

    async fn build_for_update(&mut self, id: Id) -> StoreResult<Option<Build>> {
        // The transaction owns the whole state lock; every read is stable.
        Ok(self.state.builds.get(&id).cloned())
    }

    async fn set_build_status(&mut self, build_id: Id, status: BuildStatus) -> StoreResult<()> {
        let build = self
            .state
            .builds
            .get_mut(&build_id)
            .ok_or(StoreError::NotFound("build"))?;
        build.status = status;
        Ok(())
    }

    async fn set_run_status(
        &mut self,
        run_id: Id,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let run = self
            .state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::NotFound("run"))?;
        run.status = status;
        run.updated = now;
        Ok(())
    }

    async fn append_log_lines(
        &mut self,
        run_id: Id,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<LogLine>> {
        let mut number = self
            .state
            .log_lines
            .values()
            .filter(|line| line.run_id == run_id)
            .map(|line| line.number)
            .max()
            .unwrap_or(0);

        let mut inserted = Vec::with_capacity(lines.len());
        for line in lines {
            number += 1;
            let row = LogLine {
                id: self.state.allocate(),
                run_id,
                number,
                time: now,
                content: clip_log_content(line).to_string(),
            };
            self.state.log_lines.insert(row.id, row.clone());
            inserted.push(row);
        }

        let run = self
            .state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::NotFound("run"))?;
        run.updated = now;
        Ok(inserted)
    }

    async fn stalled_runs(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StalledRun>> {
        let mut stalled = Vec::new();
        for run in self.state.runs.values() {
            if run.status != RunStatus::Active || run.updated >= cutoff {
                continue;
            }
            let Some(build) = self.state.builds.get(&run.build_id) else {
                continue;
            };
            stalled.push(StalledRun {
                run_id: run.id,
                build_id: build.id,
                build_status: build.status,
            });
        }
        Ok(stalled)
    }

    async fn clear_build_outcome(&mut self, build_id: Id) -> StoreResult<()> {
        let build = self
            .state
            .builds
            .get_mut(&build_id)
            .ok_or(StoreError::NotFound("build"))?;
        build.package_id = None;
        build.recipe_revision_id = None;
        self.state
            .missing_recipe
            .retain(|(build, _)| *build != build_id);
        self.state
            .missing_package
            .retain(|(build, _)| *build != build_id);
        Ok(())
    }

    async fn upsert_recipe(
        &mut self,
        ecosystem_id: Id,
        name: &str,
        version: &str,
        user: Option<&str>,
        channel: Option<&str>,
    ) -> StoreResult<Recipe> {
        let existing = self.state.recipes.values().find(|recipe| {
            recipe.ecosystem_id == ecosystem_id
                && recipe.name == name
                && recipe.version == version
                && recipe.user.as_deref() == user
                && recipe.channel.as_deref() == channel
        });
        if let Some(recipe) = existing {
            return Ok(recipe.clone());
        }
        let recipe = Recipe {
            id: self.state.allocate(),
            ecosystem_id,
            name: name.to_string(),
            version: version.to_string(),
            user: user.map(str::to_string),
            channel: channel.map(str::to_string),
            current_revision_id: None,
        };
        self.state.recipes.insert(recipe.id, recipe.clone());
        Ok(recipe)
    }

    async fn upsert_recipe_revision(
        &mut self,
        recipe_id: Id,
        revision: &str,
    ) -> StoreResult<RecipeRevision> {
        let existing = self
            .state
            .revisions
            .values()
            .find(|row| row.recipe_id == recipe_id && row.revision == revision);
        if let Some(row) = existing {
            return Ok(row.clone());
        }
        let row = RecipeRevision {
            id: self.state.allocate(),
            recipe_id,
            revision: revision.to_string(),
        };
        self.state.revisions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_recipe_current_revision(
        &mut self,
        recipe_id: Id,
        revision_id: Id,
    ) -> StoreResult<()> {
        let recipe = self
            .state
            .recipes
            .get_mut(&recipe_id)
            .ok_or(StoreError::NotFound("recipe"))?;
        recipe.current_revision_id = Some(revision_id);
        Ok(())
    }

    async fn upsert_package(
        &mut self,
        recipe_revision_id: Id,
        package_id: &str,
    ) -> StoreResult<Package> {
        let existing = self
            .state
            .packages
            .values()
            .find(|row| row.recipe_revision_id == recipe_revision_id && row.package_id == package_id);
        if let Some(row) = existing {
            return Ok(row.clone());
        }
        let row = Package {
            id: self.state.allocate(),
            recipe_revision_id,
            package_id: package_id.to_string(),
        };
        self.state.packages.insert(row.id, row.clone());
        Ok(row)
    }

    async fn recipe_revision(&mut self, id: Id) -> StoreResult<Option<RecipeRevision>> {
        Ok(self.state.revisions.get(&id).cloned())
    }

    async fn set_build_package(
        &mut self,
        build_id: Id,
        package_id: Option<Id>,
    ) -> StoreResult<()> {
        let build = self
            .state
            .builds
            .get_mut(&build_id)
            .ok_or(StoreError::NotFound("build"))?;
        build.package_id = package_id;
        Ok(())
    }

    async fn set_build_recipe_revision(
        &mut self,
        build_id: Id,
        revision_id: Option<Id>,
    ) -> StoreResult<()> {
        let build = self
            .state
            .builds
            .get_mut(&build_id)
            .ok_or(StoreError::NotFound("build"))?;
        build.recipe_revision_id = revision_id;
        Ok(())
    }

    async fn add_missing_recipe(&mut self, build_id: Id, recipe_id: Id) -> StoreResult<()> {
        self.state.missing_recipe.insert((build_id, recipe_id));
        Ok(())
    }

    async fn add_missing_package(&mut self, build_id: Id, package_id: Id) -> StoreResult<()> {
        self.state.missing_package.insert((build_id, package_id));
        Ok(())
    }

    async fn set_package_requires(&mut self, package_id: Id, requires: &[Id]) -> StoreResult<()> {
        self.state
            .package_requirement
            .retain(|(package, _)| *package != package_id);
        for requirement in requires {
            if *requirement == package_id {
                continue;
            }
            self.state
                .package_requirement
                .insert((package_id, *requirement));
        }
        Ok(())
    }

    async fn builds_waiting_for_recipe(&mut self, recipe_id: Id) -> StoreResult<Vec<Id>> {
        let state = &self.state;
        let mut waiting: Vec<Id> = state
            .missing_recipe
            .iter()
            .filter(|(_, recipe)| *recipe == recipe_id)
            .map(|(build, _)| *build)
            .filter(|build_id| waiting_filter(state, *build_id))
            .collect();
        waiting.sort_unstable();
        waiting.dedup();
        Ok(waiting)
    }

    async fn builds_waiting_for_package(&mut self, package: &Package) -> StoreResult<Vec<Id>> {
        let state = &self.state;
        let revision = state
            .revisions
            .get(&package.recipe_revision_id)
            .ok_or(StoreError::NotFound("recipe revision"))?;

        let mut waiting = Vec::new();
        for (build_id, missing_id) in state.missing_package.iter() {
            if !waiting_filter(state, *build_id) {
                continue;
            }
            if *missing_id == package.id {
                waiting.push(*build_id);
                continue;
            }
            // Same recipe at a different revision unblocks regardless of the
            // package id, which may change across revisions.
            let Some(missing) = state.packages.get(missing_id) else {
                continue;
            };
            let Some(missing_revision) = state.revisions.get(&missing.recipe_revision_id) else {
                continue;
            };
            if missing_revision.recipe_id == revision.recipe_id
                && missing_revision.revision != revision.revision
            {
                waiting.push(*build_id);
            }
        }
        waiting.sort_unstable();
        waiting.dedup();
        Ok(waiting)
    }

    async fn missing_recipes(&mut self, build_id: Id) -> StoreResult<Vec<Recipe>> {
        Ok(self
            .state
            .missing_recipe
            .iter()
            .filter(|(build, _)| *build == build_id)
            .filter_map(|(_, recipe)| self.state.recipes.get(recipe).cloned())
            .collect())
    }

    async fn missing_packages(&mut self, build_id: Id) -> StoreResult<Vec<Package>> {
        Ok(self
            .state
            .missing_package
            .iter()
            .filter(|(build, _)| *build == build_id)
            .filter_map(|(_, package)| self.state.packages.get(package).cloned())
            .collect())
    }
}

/// Re-trigger candidates must be failed builds of commits still `building`.
fn waiting_filter(state: &MemState, build_id: Id) -> bool {
    let Some(build) = state.builds.get(&build_id) else {
        return false;
    };
    if build.status != BuildStatus::Error {
        return false;
    }
    state
        .commits
        .get(&build.commit_id)
        .is_some_and(|commit| commit.status == CommitStatus::Building)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildOption, ConanCredential};

    async fn seed_minimal(store: &MemStore) -> (Repo, Channel, Profile) {
        store
            .seed_configuration(Configuration {
                id: 0,
                ssh_key: String::new(),
                public_ssh_key: String::new(),
                known_hosts: String::new(),
                webhook_secret: "secret".to_string(),
                git_credentials: vec![],
                docker_credentials: vec![],
            })
            .await;
        let ecosystem = store
            .seed_ecosystem(Ecosystem {
                id: 0,
                name: "main".to_string(),
                user: "kiln".to_string(),
                conan_config_url: "https://example.com/config.git".to_string(),
                conan_config_path: String::new(),
                conan_config_branch: String::new(),
                conan_credentials: vec![ConanCredential {
                    remote: "default".to_string(),
                    username: "kiln".to_string(),
                    password: "secret".to_string(),
                }],
            })
            .await;
        let repo = store
            .seed_repo(Repo {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "hello".to_string(),
                url: "git@example.com:acme/hello.git".to_string(),
                path: String::new(),
                version: String::new(),
                exclude: vec![],
                options: vec![BuildOption {
                    key: "shared".to_string(),
                    value: "True".to_string(),
                }],
            })
            .await;
        let channel = store
            .seed_channel(Channel {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "stable".to_string(),
                ref_pattern: "heads/main".to_string(),
                conan_channel: "stable".to_string(),
            })
            .await;
        let profile = store
            .seed_profile(Profile {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "linux-gcc".to_string(),
                platform: Platform::Linux,
                container: "kiln/build:latest".to_string(),
                conan_profile: "linux-gcc".to_string(),
                labels: vec![],
            })
            .await;
        (repo, channel, profile)
    }

    async fn seed_build(store: &MemStore) -> Build {
        let (repo, channel, profile) = seed_minimal(store).await;
        let mut tx = store.begin().await.unwrap();
        let commit = tx
            .insert_commit(&NewCommit {
                repo_id: repo.id,
                channel_id: channel.id,
                sha: "abc123".to_string(),
                message: "initial".to_string(),
                user_name: "dev".to_string(),
                user_email: "dev@example.com".to_string(),
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
        build
    }

    #[tokio::test]
    async fn lease_takes_each_build_once() {
        let store = MemStore::new();
        let build = seed_build(&store).await;

        let mut tx = store.begin().await.unwrap();
        let leased = tx.lease_build(Platform::Linux, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        let leased = leased.expect("one build is leasable");
        assert_eq!(leased.build.id, build.id);
        assert_eq!(leased.repo.url, "git@example.com:acme/hello.git");

        let mut tx = store.begin().await.unwrap();
        let second = tx.lease_build(Platform::Linux, Utc::now()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn lease_respects_platform() {
        let store = MemStore::new();
        seed_build(&store).await;
        let mut tx = store.begin().await.unwrap();
        let leased = tx.lease_build(Platform::Windows, Utc::now()).await.unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn log_lines_are_dense_per_run() {
        let store = MemStore::new();
        let build = seed_build(&store).await;
        let mut tx = store.begin().await.unwrap();
        let leased = tx
            .lease_build(Platform::Linux, Utc::now())
            .await
            .unwrap()
            .unwrap();
        tx.append_log_lines(
            leased.run_id,
            &["one".to_string(), "two".to_string()],
            Utc::now(),
        )
        .await
        .unwrap();
        tx.append_log_lines(leased.run_id, &["three".to_string()], Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let numbers: Vec<i64> = store
            .log_lines_for_run(leased.run_id)
            .await
            .iter()
            .map(|line| line.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        let _ = build;
    }

    #[tokio::test]
    async fn waiting_builds_match_exact_and_cross_revision_packages() {
        let store = MemStore::new();
        let build = seed_build(&store).await;

        let mut tx = store.begin().await.unwrap();
        tx.set_build_status(build.id, BuildStatus::Active)
            .await
            .unwrap();
        tx.set_build_status(build.id, BuildStatus::Error)
            .await
            .unwrap();
        let recipe = tx
            .upsert_recipe(1, "zlib", "1.3", None, None)
            .await
            .unwrap();
        let old_revision = tx.upsert_recipe_revision(recipe.id, "rev1").await.unwrap();
        let missing = tx.upsert_package(old_revision.id, "pkg-a").await.unwrap();
        tx.add_missing_package(build.id, missing.id).await.unwrap();

        // Exact match.
        let waiting = tx.builds_waiting_for_package(&missing).await.unwrap();
        assert_eq!(waiting, vec![build.id]);

        // Same recipe, different revision, different package id.
        let new_revision = tx.upsert_recipe_revision(recipe.id, "rev2").await.unwrap();
        let produced = tx.upsert_package(new_revision.id, "pkg-b").await.unwrap();
        let waiting = tx.builds_waiting_for_package(&produced).await.unwrap();
        assert_eq!(waiting, vec![build.id]);

        // Different recipe entirely.
        let other = tx.upsert_recipe(1, "boost", "1.84", None, None).await.unwrap();
        let other_revision = tx.upsert_recipe_revision(other.id, "rev1").await.unwrap();
        let unrelated = tx.upsert_package(other_revision.id, "pkg-c").await.unwrap();
        let waiting = tx.builds_waiting_for_package(&unrelated).await.unwrap();
        assert!(waiting.is_empty());
    }

    #[tokio::test]
    async fn requirements_drop_self_references() {
        let store = MemStore::new();
        seed_build(&store).await;
        let mut tx = store.begin().await.unwrap();
        let recipe = tx.upsert_recipe(1, "app", "1.0", None, None).await.unwrap();
        let revision = tx.upsert_recipe_revision(recipe.id, "").await.unwrap();
        let package = tx.upsert_package(revision.id, "pkg").await.unwrap();
        let dep = tx.upsert_package(revision.id, "dep").await.unwrap();
        tx.set_package_requires(package.id, &[dep.id, package.id, dep.id])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.package_requires(package.id).await, vec![dep.id]);
    }
}
