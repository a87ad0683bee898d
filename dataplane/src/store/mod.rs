//! Transactional store traits.
//!
//! The store is the only shared mutable resource between workers, and all
//! multi-row mutations happen inside a single transaction. Workers are
//! generic over [`Store`]; production uses [`postgres::PgStore`] and tests
//! use [`memory::MemStore`], which serializes transactions on one lock and
//! therefore exhibits the same row-stability the PostgreSQL row locks give.
//!
//! Reads that drive a transition go through `*_for_update` / `lease_*`
//! operations so the row stays stable until commit.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Build, BuildStatus, Channel, Commit, CommitStatus, Configuration, Ecosystem, Id, LeasedBuild,
    LogLine, NewCommit, Package, Platform, Profile, Recipe, RecipeRevision, Repo, RunStatus,
    StalledRun,
};

pub use self::memory::MemStore;
pub use self::postgres::PgStore;

/// Delay before retrying an iteration after a transient store error.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Connect attempts at startup before giving up with exit code 1.
pub const CONNECT_ATTEMPTS: u32 = 18;

/// Store-enforced bound on one log line's content.
pub const LOG_LINE_MAX_BYTES: usize = 64 * 1024;

/// Clip a log line to [`LOG_LINE_MAX_BYTES`] on a char boundary. Builder
/// output is already lossy-decoded, so clipping never splits a code point.
pub fn clip_log_content(line: &str) -> &str {
    if line.len() <= LOG_LINE_MAX_BYTES {
        return line;
    }
    let mut end = LOG_LINE_MAX_BYTES;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

/// Error type for all store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient failure (connection lost, pool exhausted, deadlock). The
    /// iteration policy is: log, sleep [`RETRY_DELAY`], retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row the caller relied on does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A persisted value could not be interpreted (unknown status spelling,
    /// malformed credential JSON).
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Any other backend failure; not retried.
    #[error("store operation failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the sleep-and-retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<crate::model::InvalidStatus> for StoreError {
    fn from(err: crate::model::InvalidStatus) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the relational store; `begin` opens a transaction.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// One open transaction. Dropping a transaction without `commit` rolls it
/// back in the PostgreSQL implementation.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self) -> StoreResult<()>;

    // Topology and configuration.

    /// The process-wide configuration singleton.
    async fn configuration(&mut self) -> StoreResult<Configuration>;
    async fn ecosystem(&mut self, id: Id) -> StoreResult<Option<Ecosystem>>;
    async fn repos(&mut self) -> StoreResult<Vec<Repo>>;
    async fn repo(&mut self, id: Id) -> StoreResult<Option<Repo>>;
    /// Channels of one ecosystem.
    async fn channels(&mut self, ecosystem_id: Id) -> StoreResult<Vec<Channel>>;
    async fn profiles(&mut self) -> StoreResult<Vec<Profile>>;

    // Commits.

    async fn commit_exists(&mut self, repo_id: Id, channel_id: Id, sha: &str)
        -> StoreResult<bool>;
    /// Commits on (repo, channel) whose status is not `old`.
    async fn current_commits(&mut self, repo_id: Id, channel_id: Id) -> StoreResult<Vec<Commit>>;
    async fn insert_commit(&mut self, commit: &NewCommit) -> StoreResult<Commit>;
    async fn set_commit_status(&mut self, commit_id: Id, status: CommitStatus) -> StoreResult<()>;
    async fn new_commits(&mut self) -> StoreResult<Vec<Commit>>;
    async fn commit_by_id(&mut self, id: Id) -> StoreResult<Option<Commit>>;

    // Builds and runs.

    async fn insert_build(
        &mut self,
        commit_id: Id,
        profile_id: Id,
        created: DateTime<Utc>,
    ) -> StoreResult<Build>;
    async fn count_new_builds(&mut self) -> StoreResult<i64>;
    /// Lease one `new` build for `platform`: lock it (skipping rows locked
    /// by concurrent agents), flip it to `active`, create its run, and
    /// snapshot everything the builder needs.
    async fn lease_build(
        &mut self,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeasedBuild>>;
    async fn build(&mut self, id: Id) -> StoreResult<Option<Build>>;
    /// Read a build under a row lock, for a subsequent status transition.
    async fn build_for_update(&mut self, id: Id) -> StoreResult<Option<Build>>;
    async fn set_build_status(&mut self, build_id: Id, status: BuildStatus) -> StoreResult<()>;
    /// Also advances `run.updated` to `now`.
    async fn set_run_status(
        &mut self,
        run_id: Id,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Append lines with dense per-run numbering and advance `run.updated`.
    async fn append_log_lines(
        &mut self,
        run_id: Id,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<LogLine>>;
    /// Runs still `active` whose `updated` is older than `cutoff`, joined
    /// with their build's status.
    async fn stalled_runs(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StalledRun>>;

    // Recipe / revision / package graph.

    /// Reset the build's outcome: package, partial revision, missing links.
    async fn clear_build_outcome(&mut self, build_id: Id) -> StoreResult<()>;
    async fn upsert_recipe(
        &mut self,
        ecosystem_id: Id,
        name: &str,
        version: &str,
        user: Option<&str>,
        channel: Option<&str>,
    ) -> StoreResult<Recipe>;
    async fn upsert_recipe_revision(
        &mut self,
        recipe_id: Id,
        revision: &str,
    ) -> StoreResult<RecipeRevision>;
    async fn set_recipe_current_revision(
        &mut self,
        recipe_id: Id,
        revision_id: Id,
    ) -> StoreResult<()>;
    async fn upsert_package(
        &mut self,
        recipe_revision_id: Id,
        package_id: &str,
    ) -> StoreResult<Package>;
    async fn recipe_revision(&mut self, id: Id) -> StoreResult<Option<RecipeRevision>>;
    async fn set_build_package(&mut self, build_id: Id, package_id: Option<Id>)
        -> StoreResult<()>;
    async fn set_build_recipe_revision(
        &mut self,
        build_id: Id,
        revision_id: Option<Id>,
    ) -> StoreResult<()>;
    async fn add_missing_recipe(&mut self, build_id: Id, recipe_id: Id) -> StoreResult<()>;
    async fn add_missing_package(&mut self, build_id: Id, package_id: Id) -> StoreResult<()>;
    /// Replace the package's requirement edges. The caller de-duplicates
    /// refs within one resolution pass, which keeps the graph cycle-free.
    async fn set_package_requires(&mut self, package_id: Id, requires: &[Id]) -> StoreResult<()>;
    /// `error` builds of `building` commits waiting on this recipe.
    async fn builds_waiting_for_recipe(&mut self, recipe_id: Id) -> StoreResult<Vec<Id>>;
    /// `error` builds of `building` commits waiting on this package: exact
    /// (revision, package-id) matches plus any missing package of the same
    /// recipe at a *different* revision, regardless of package id.
    async fn builds_waiting_for_package(&mut self, package: &Package) -> StoreResult<Vec<Id>>;
    /// Recipes referenced in `missing_recipe` rows of this build.
    async fn missing_recipes(&mut self, build_id: Id) -> StoreResult<Vec<Recipe>>;
    /// Packages referenced in `missing_package` rows of this build.
    async fn missing_packages(&mut self, build_id: Id) -> StoreResult<Vec<Package>>;
}
