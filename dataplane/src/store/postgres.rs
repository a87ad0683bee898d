//! PostgreSQL store.
//!
//! Raw SQL throughout; rows are mapped by hand with `Row::try_get` so the
//! crate builds without a live database. Lease reads use
//! `FOR UPDATE SKIP LOCKED`, transition reads use `FOR UPDATE`, and every
//! worker iteration runs inside one [`PgTx`] transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};

use crate::model::{
    Build, BuildStatus, Channel, Commit, CommitStatus, Configuration, Ecosystem, Id, LeasedBuild,
    LogLine, NewCommit, Package, Platform, Profile, Recipe, RecipeRevision, Repo, RunStatus,
    StalledRun,
};
use crate::store::{
    clip_log_content, Store, StoreError, StoreResult, StoreTx, CONNECT_ATTEMPTS, RETRY_DELAY,
};

/// Table definitions, applied idempotently by [`PgStore::ensure_schema`].
/// Versioned migrations live outside the core.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ecosystem (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    "user" VARCHAR(255) NOT NULL DEFAULT '',
    conan_config_url VARCHAR(255) NOT NULL DEFAULT '',
    conan_config_path VARCHAR(255) NOT NULL DEFAULT '',
    conan_config_branch VARCHAR(255) NOT NULL DEFAULT '',
    conan_credentials JSONB NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS configuration (
    id BIGSERIAL PRIMARY KEY,
    ssh_key TEXT NOT NULL DEFAULT '',
    public_ssh_key TEXT NOT NULL DEFAULT '',
    known_hosts TEXT NOT NULL DEFAULT '',
    webhook_secret VARCHAR(255) NOT NULL DEFAULT '',
    git_credentials JSONB NOT NULL DEFAULT '[]',
    docker_credentials JSONB NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS repo (
    id BIGSERIAL PRIMARY KEY,
    ecosystem_id BIGINT NOT NULL REFERENCES ecosystem(id),
    name VARCHAR(255) NOT NULL DEFAULT '',
    url VARCHAR(255) NOT NULL,
    path VARCHAR(255) NOT NULL DEFAULT '',
    version VARCHAR(255) NOT NULL DEFAULT '',
    exclude TEXT[] NOT NULL DEFAULT '{}',
    options JSONB NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS channel (
    id BIGSERIAL PRIMARY KEY,
    ecosystem_id BIGINT NOT NULL REFERENCES ecosystem(id),
    name VARCHAR(255) NOT NULL,
    ref_pattern VARCHAR(255) NOT NULL,
    conan_channel VARCHAR(255) NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS profile (
    id BIGSERIAL PRIMARY KEY,
    ecosystem_id BIGINT NOT NULL REFERENCES ecosystem(id),
    name VARCHAR(255) NOT NULL,
    platform VARCHAR(16) NOT NULL,
    container VARCHAR(255) NOT NULL,
    conan_profile VARCHAR(255) NOT NULL DEFAULT '',
    labels TEXT[] NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS "commit" (
    id BIGSERIAL PRIMARY KEY,
    repo_id BIGINT NOT NULL REFERENCES repo(id),
    channel_id BIGINT NOT NULL REFERENCES channel(id),
    sha VARCHAR(255) NOT NULL,
    message VARCHAR(255) NOT NULL DEFAULT '',
    user_name VARCHAR(255) NOT NULL DEFAULT '',
    user_email VARCHAR(255) NOT NULL DEFAULT '',
    status VARCHAR(16) NOT NULL
);
CREATE INDEX IF NOT EXISTS commit_repo_channel_idx ON "commit"(repo_id, channel_id);

CREATE TABLE IF NOT EXISTS recipe (
    id BIGSERIAL PRIMARY KEY,
    ecosystem_id BIGINT NOT NULL REFERENCES ecosystem(id),
    name VARCHAR(255) NOT NULL,
    version VARCHAR(255) NOT NULL DEFAULT '',
    "user" VARCHAR(255),
    channel VARCHAR(255),
    current_revision_id BIGINT
);

CREATE TABLE IF NOT EXISTS recipe_revision (
    id BIGSERIAL PRIMARY KEY,
    recipe_id BIGINT NOT NULL REFERENCES recipe(id),
    revision VARCHAR(255) NOT NULL DEFAULT '',
    UNIQUE (recipe_id, revision)
);

CREATE TABLE IF NOT EXISTS package (
    id BIGSERIAL PRIMARY KEY,
    recipe_revision_id BIGINT NOT NULL REFERENCES recipe_revision(id),
    package_id VARCHAR(255) NOT NULL,
    UNIQUE (recipe_revision_id, package_id)
);

CREATE TABLE IF NOT EXISTS build (
    id BIGSERIAL PRIMARY KEY,
    commit_id BIGINT NOT NULL REFERENCES "commit"(id),
    profile_id BIGINT NOT NULL REFERENCES profile(id),
    created TIMESTAMPTZ NOT NULL,
    status VARCHAR(16) NOT NULL,
    package_id BIGINT REFERENCES package(id),
    recipe_revision_id BIGINT REFERENCES recipe_revision(id)
);
CREATE INDEX IF NOT EXISTS build_status_idx ON build(status);
CREATE INDEX IF NOT EXISTS build_created_idx ON build(created);

CREATE TABLE IF NOT EXISTS run (
    id BIGSERIAL PRIMARY KEY,
    build_id BIGINT NOT NULL REFERENCES build(id),
    started TIMESTAMPTZ NOT NULL,
    updated TIMESTAMPTZ NOT NULL,
    status VARCHAR(16) NOT NULL
);
CREATE INDEX IF NOT EXISTS run_updated_idx ON run(updated);

CREATE TABLE IF NOT EXISTS log_line (
    id BIGSERIAL PRIMARY KEY,
    run_id BIGINT NOT NULL REFERENCES run(id),
    number BIGINT NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    content TEXT NOT NULL,
    UNIQUE (run_id, number)
);

CREATE TABLE IF NOT EXISTS missing_recipe (
    build_id BIGINT NOT NULL REFERENCES build(id),
    recipe_id BIGINT NOT NULL REFERENCES recipe(id),
    PRIMARY KEY (build_id, recipe_id)
);

CREATE TABLE IF NOT EXISTS missing_package (
    build_id BIGINT NOT NULL REFERENCES build(id),
    package_id BIGINT NOT NULL REFERENCES package(id),
    PRIMARY KEY (build_id, package_id)
);

CREATE TABLE IF NOT EXISTS package_requirement (
    package_id BIGINT NOT NULL REFERENCES package(id),
    requirement_id BIGINT NOT NULL REFERENCES package(id),
    PRIMARY KEY (package_id, requirement_id)
);
"#;

/// Pooled PostgreSQL store handle.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with the startup retry policy: [`CONNECT_ATTEMPTS`] attempts,
    /// [`RETRY_DELAY`] apart. Callers exit with code 1 when this fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            info!(attempt, of = CONNECT_ATTEMPTS, "connect to store");
            match PgPoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
            {
                Ok(pool) => {
                    info!("connected to store");
                    return Ok(Self { pool });
                }
                Err(err) => {
                    warn!(error = %err, "failed to connect to store");
                    last_error = Some(err);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(StoreError::Unavailable(
            last_error.map(|err| err.to_string()).unwrap_or_default(),
        ))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> StoreResult<PgTx> {
        let tx = self.pool.begin().await.map_err(map_err)?;
        Ok(PgTx { tx })
    }
}

/// One open PostgreSQL transaction; dropped without `commit` it rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn configuration(&mut self) -> StoreResult<Configuration> {
        let row = sqlx::query(
            "SELECT id, ssh_key, public_ssh_key, known_hosts, webhook_secret, \
             git_credentials, docker_credentials FROM configuration LIMIT 1",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?
        .ok_or(StoreError::NotFound("configuration"))?;
        configuration_from_row(&row)
    }

    async fn ecosystem(&mut self, id: Id) -> StoreResult<Option<Ecosystem>> {
        let row = sqlx::query(
            "SELECT id, name, \"user\", conan_config_url, conan_config_path, \
             conan_config_branch, conan_credentials FROM ecosystem WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(ecosystem_from_row).transpose()
    }

    async fn repos(&mut self) -> StoreResult<Vec<Repo>> {
        let rows = sqlx::query(
            "SELECT id, ecosystem_id, name, url, path, version, exclude, options \
             FROM repo ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(repo_from_row).collect()
    }

    async fn repo(&mut self, id: Id) -> StoreResult<Option<Repo>> {
        let row = sqlx::query(
            "SELECT id, ecosystem_id, name, url, path, version, exclude, options \
             FROM repo WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(repo_from_row).transpose()
    }

    async fn channels(&mut self, ecosystem_id: Id) -> StoreResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, ecosystem_id, name, ref_pattern, conan_channel \
             FROM channel WHERE ecosystem_id = $1 ORDER BY id",
        )
        .bind(ecosystem_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn profiles(&mut self) -> StoreResult<Vec<Profile>> {
        let rows = sqlx::query(
            "SELECT id, ecosystem_id, name, platform, container, conan_profile, labels \
             FROM profile ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn commit_exists(
        &mut self,
        repo_id: Id,
        channel_id: Id,
        sha: &str,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM \"commit\" \
             WHERE repo_id = $1 AND channel_id = $2 AND sha = $3 LIMIT 1",
        )
        .bind(repo_id)
        .bind(channel_id)
        .bind(sha)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(row.is_some())
    }

    async fn current_commits(&mut self, repo_id: Id, channel_id: Id) -> StoreResult<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT id, repo_id, channel_id, sha, message, user_name, user_email, status \
             FROM \"commit\" \
             WHERE repo_id = $1 AND channel_id = $2 AND status <> 'old' ORDER BY id",
        )
        .bind(repo_id)
        .bind(channel_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn insert_commit(&mut self, commit: &NewCommit) -> StoreResult<Commit> {
        let row = sqlx::query(
            "INSERT INTO \"commit\" (repo_id, channel_id, sha, message, user_name, user_email, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'new') \
             RETURNING id, repo_id, channel_id, sha, message, user_name, user_email, status",
        )
        .bind(commit.repo_id)
        .bind(commit.channel_id)
        .bind(&commit.sha)
        .bind(&commit.message)
        .bind(&commit.user_name)
        .bind(&commit.user_email)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        commit_from_row(&row)
    }

    async fn set_commit_status(&mut self, commit_id: Id, status: CommitStatus) -> StoreResult<()> {
        sqlx::query("UPDATE \"commit\" SET status = $2 WHERE id = $1")
            .bind(commit_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn new_commits(&mut self) -> StoreResult<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT id, repo_id, channel_id, sha, message, user_name, user_email, status \
             FROM \"commit\" WHERE status = 'new' ORDER BY id FOR UPDATE",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn commit_by_id(&mut self, id: Id) -> StoreResult<Option<Commit>> {
        self.commit_row(id).await
    }

    async fn insert_build(
        &mut self,
        commit_id: Id,
        profile_id: Id,
        created: DateTime<Utc>,
    ) -> StoreResult<Build> {
        let row = sqlx::query(
            "INSERT INTO build (commit_id, profile_id, created, status) \
             VALUES ($1, $2, $3, 'new') \
             RETURNING id, commit_id, profile_id, created, status, package_id, recipe_revision_id",
        )
        .bind(commit_id)
        .bind(profile_id)
        .bind(created)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        build_from_row(&row)
    }

    async fn count_new_builds(&mut self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM build WHERE status = 'new'")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.try_get::<i64, _>("count").map_err(map_err)
    }

    async fn lease_build(
        &mut self,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeasedBuild>> {
        // The SKIP LOCKED lease is the sole coordination primitive between
        // concurrent agents: a row locked by another agent is skipped, not
        // blocked on.
        let candidate = sqlx::query(
            "SELECT b.id FROM build b \
             JOIN profile p ON p.id = b.profile_id \
             WHERE b.status = 'new' AND p.platform = $1 \
             ORDER BY b.id LIMIT 1 \
             FOR UPDATE OF b SKIP LOCKED",
        )
        .bind(platform.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let build_id: Id = candidate.try_get("id").map_err(map_err)?;

        let build_row = sqlx::query(
            "UPDATE build SET status = 'active' WHERE id = $1 \
             RETURNING id, commit_id, profile_id, created, status, package_id, recipe_revision_id",
        )
        .bind(build_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        let build = build_from_row(&build_row)?;

        let run_row = sqlx::query(
            "INSERT INTO run (build_id, started, updated, status) \
             VALUES ($1, $2, $2, 'active') RETURNING id",
        )
        .bind(build_id)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        let run_id: Id = run_row.try_get("id").map_err(map_err)?;

        let commit = self
            .commit_row(build.commit_id)
            .await?
            .ok_or(StoreError::NotFound("commit"))?;
        let repo = self.repo(commit.repo_id).await?.ok_or(StoreError::NotFound("repo"))?;
        let channel = self
            .channel_row(commit.channel_id)
            .await?
            .ok_or(StoreError::NotFound("channel"))?;
        let profile = self
            .profile_row(build.profile_id)
            .await?
            .ok_or(StoreError::NotFound("profile"))?;
        let ecosystem = self
            .ecosystem(profile.ecosystem_id)
            .await?
            .ok_or(StoreError::NotFound("ecosystem"))?;
        let configuration = self.configuration().await?;

        Ok(Some(LeasedBuild {
            build,
            run_id,
            commit,
            repo,
            channel,
            profile,
            ecosystem,
            configuration,
        }))
    }

    async fn build(&mut self, id: Id) -> StoreResult<Option<Build>> {
        let row = sqlx::query(
            "SELECT id, commit_id, profile_id, created, status, package_id, recipe_revision_id \
             FROM build WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn build_for_update(&mut self, id: Id) -> StoreResult<Option<Build>> {
        let row = sqlx::query(
            "SELECT id, commit_id, profile_id, created, status, package_id, recipe_revision_id \
             FROM build WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn set_build_status(&mut self, build_id: Id, status: BuildStatus) -> StoreResult<()> {
        sqlx::query("UPDATE build SET status = $2 WHERE id = $1")
            .bind(build_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_run_status(
        &mut self,
        run_id: Id,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE run SET status = $2, updated = $3 WHERE id = $1")
            .bind(run_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn append_log_lines(
        &mut self,
        run_id: Id,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<LogLine>> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(number), 0) AS last FROM log_line WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        let mut number: i64 = row.try_get("last").map_err(map_err)?;

        let mut inserted = Vec::with_capacity(lines.len());
        for line in lines {
            number += 1;
            let content = clip_log_content(line);
            let row = sqlx::query(
                "INSERT INTO log_line (run_id, number, time, content) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(run_id)
            .bind(number)
            .bind(now)
            .bind(content)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_err)?;
            inserted.push(LogLine {
                id: row.try_get("id").map_err(map_err)?,
                run_id,
                number,
                time: now,
                content: content.to_string(),
            });
        }

        sqlx::query("UPDATE run SET updated = $2 WHERE id = $1")
            .bind(run_id)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(inserted)
    }

    async fn stalled_runs(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StalledRun>> {
        let rows = sqlx::query(
            "SELECT r.id AS run_id, b.id AS build_id, b.status AS build_status \
             FROM run r JOIN build b ON b.id = r.build_id \
             WHERE r.status = 'active' AND r.updated < $1 \
             ORDER BY r.id FOR UPDATE OF r, b",
        )
        .bind(cutoff)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;

        rows.iter()
            .map(|row| {
                Ok(StalledRun {
                    run_id: row.try_get("run_id").map_err(map_err)?,
                    build_id: row.try_get("build_id").map_err(map_err)?,
                    build_status: row
                        .try_get::<String, _>("build_status")
                        .map_err(map_err)?
                        .parse()?,
                })
            })
            .collect()
    }

    async fn clear_build_outcome(&mut self, build_id: Id) -> StoreResult<()> {
        sqlx::query("UPDATE build SET package_id = NULL, recipe_revision_id = NULL WHERE id = $1")
            .bind(build_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM missing_recipe WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM missing_package WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
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
        let existing = sqlx::query(
            "SELECT id, ecosystem_id, name, version, \"user\", channel, current_revision_id \
             FROM recipe \
             WHERE ecosystem_id = $1 AND name = $2 AND version = $3 \
             AND \"user\" IS NOT DISTINCT FROM $4 AND channel IS NOT DISTINCT FROM $5",
        )
        .bind(ecosystem_id)
        .bind(name)
        .bind(version)
        .bind(user)
        .bind(channel)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        if let Some(row) = existing {
            return recipe_from_row(&row);
        }

        let row = sqlx::query(
            "INSERT INTO recipe (ecosystem_id, name, version, \"user\", channel) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, ecosystem_id, name, version, \"user\", channel, current_revision_id",
        )
        .bind(ecosystem_id)
        .bind(name)
        .bind(version)
        .bind(user)
        .bind(channel)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        recipe_from_row(&row)
    }

    async fn upsert_recipe_revision(
        &mut self,
        recipe_id: Id,
        revision: &str,
    ) -> StoreResult<RecipeRevision> {
        let row = sqlx::query(
            "INSERT INTO recipe_revision (recipe_id, revision) VALUES ($1, $2) \
             ON CONFLICT (recipe_id, revision) DO UPDATE SET revision = EXCLUDED.revision \
             RETURNING id, recipe_id, revision",
        )
        .bind(recipe_id)
        .bind(revision)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(RecipeRevision {
            id: row.try_get("id").map_err(map_err)?,
            recipe_id: row.try_get("recipe_id").map_err(map_err)?,
            revision: row.try_get("revision").map_err(map_err)?,
        })
    }

    async fn set_recipe_current_revision(
        &mut self,
        recipe_id: Id,
        revision_id: Id,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE recipe SET current_revision_id = $2 WHERE id = $1")
            .bind(recipe_id)
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn upsert_package(
        &mut self,
        recipe_revision_id: Id,
        package_id: &str,
    ) -> StoreResult<Package> {
        let row = sqlx::query(
            "INSERT INTO package (recipe_revision_id, package_id) VALUES ($1, $2) \
             ON CONFLICT (recipe_revision_id, package_id) DO UPDATE SET package_id = EXCLUDED.package_id \
             RETURNING id, recipe_revision_id, package_id",
        )
        .bind(recipe_revision_id)
        .bind(package_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(Package {
            id: row.try_get("id").map_err(map_err)?,
            recipe_revision_id: row.try_get("recipe_revision_id").map_err(map_err)?,
            package_id: row.try_get("package_id").map_err(map_err)?,
        })
    }

    async fn recipe_revision(&mut self, id: Id) -> StoreResult<Option<RecipeRevision>> {
        let row = sqlx::query("SELECT id, recipe_id, revision FROM recipe_revision WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.map(|row| {
            Ok(RecipeRevision {
                id: row.try_get("id").map_err(map_err)?,
                recipe_id: row.try_get("recipe_id").map_err(map_err)?,
                revision: row.try_get("revision").map_err(map_err)?,
            })
        })
        .transpose()
    }

    async fn set_build_package(
        &mut self,
        build_id: Id,
        package_id: Option<Id>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE build SET package_id = $2 WHERE id = $1")
            .bind(build_id)
            .bind(package_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_build_recipe_revision(
        &mut self,
        build_id: Id,
        revision_id: Option<Id>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE build SET recipe_revision_id = $2 WHERE id = $1")
            .bind(build_id)
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn add_missing_recipe(&mut self, build_id: Id, recipe_id: Id) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO missing_recipe (build_id, recipe_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(build_id)
        .bind(recipe_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn add_missing_package(&mut self, build_id: Id, package_id: Id) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO missing_package (build_id, package_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(build_id)
        .bind(package_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn set_package_requires(&mut self, package_id: Id, requires: &[Id]) -> StoreResult<()> {
        sqlx::query("DELETE FROM package_requirement WHERE package_id = $1")
            .bind(package_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        for requirement in requires {
            if *requirement == package_id {
                continue;
            }
            sqlx::query(
                "INSERT INTO package_requirement (package_id, requirement_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(package_id)
            .bind(requirement)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        }
        Ok(())
    }

    async fn builds_waiting_for_recipe(&mut self, recipe_id: Id) -> StoreResult<Vec<Id>> {
        let rows = sqlx::query(
            "SELECT DISTINCT b.id FROM build b \
             JOIN \"commit\" c ON c.id = b.commit_id \
             JOIN missing_recipe mr ON mr.build_id = b.id \
             WHERE b.status = 'error' AND c.status = 'building' AND mr.recipe_id = $1 \
             ORDER BY b.id",
        )
        .bind(recipe_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(map_err))
            .collect()
    }

    async fn builds_waiting_for_package(&mut self, package: &Package) -> StoreResult<Vec<Id>> {
        let revision = self
            .recipe_revision(package.recipe_revision_id)
            .await?
            .ok_or(StoreError::NotFound("recipe revision"))?;

        // Exact (revision, package-id) waiters.
        let exact = sqlx::query(
            "SELECT DISTINCT b.id FROM build b \
             JOIN \"commit\" c ON c.id = b.commit_id \
             JOIN missing_package mp ON mp.build_id = b.id \
             WHERE b.status = 'error' AND c.status = 'building' AND mp.package_id = $1",
        )
        .bind(package.id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;

        // Waiters on the same recipe at a different revision; package ids
        // may change across revisions, so the id is not compared.
        let cross = sqlx::query(
            "SELECT DISTINCT b.id FROM build b \
             JOIN \"commit\" c ON c.id = b.commit_id \
             JOIN missing_package mp ON mp.build_id = b.id \
             JOIN package q ON q.id = mp.package_id \
             JOIN recipe_revision qr ON qr.id = q.recipe_revision_id \
             WHERE b.status = 'error' AND c.status = 'building' \
             AND qr.recipe_id = $1 AND qr.revision <> $2",
        )
        .bind(revision.recipe_id)
        .bind(&revision.revision)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;

        let mut waiting: Vec<Id> = exact
            .iter()
            .chain(cross.iter())
            .map(|row| row.try_get("id").map_err(map_err))
            .collect::<StoreResult<_>>()?;
        waiting.sort_unstable();
        waiting.dedup();
        Ok(waiting)
    }

    async fn missing_recipes(&mut self, build_id: Id) -> StoreResult<Vec<Recipe>> {
        let rows = sqlx::query(
            "SELECT r.id, r.ecosystem_id, r.name, r.version, r.\"user\", r.channel, \
             r.current_revision_id \
             FROM recipe r JOIN missing_recipe mr ON mr.recipe_id = r.id \
             WHERE mr.build_id = $1 ORDER BY r.id",
        )
        .bind(build_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter().map(recipe_from_row).collect()
    }

    async fn missing_packages(&mut self, build_id: Id) -> StoreResult<Vec<Package>> {
        let rows = sqlx::query(
            "SELECT p.id, p.recipe_revision_id, p.package_id \
             FROM package p JOIN missing_package mp ON mp.package_id = p.id \
             WHERE mp.build_id = $1 ORDER BY p.id",
        )
        .bind(build_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter()
            .map(|row| {
                Ok(Package {
                    id: row.try_get("id").map_err(map_err)?,
                    recipe_revision_id: row.try_get("recipe_revision_id").map_err(map_err)?,
                    package_id: row.try_get("package_id").map_err(map_err)?,
                })
            })
            .collect()
    }
}

impl PgTx {
    async fn commit_row(&mut self, id: Id) -> StoreResult<Option<Commit>> {
        let row = sqlx::query(
            "SELECT id, repo_id, channel_id, sha, message, user_name, user_email, status \
             FROM \"commit\" WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(commit_from_row).transpose()
    }

    async fn channel_row(&mut self, id: Id) -> StoreResult<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, ecosystem_id, name, ref_pattern, conan_channel FROM channel WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn profile_row(&mut self, id: Id) -> StoreResult<Option<Profile>> {
        let row = sqlx::query(
            "SELECT id, ecosystem_id, name, platform, container, conan_profile, labels \
             FROM profile WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(profile_from_row).transpose()
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let transient = db
                .code()
                .map(|code| {
                    // Serialization failure, deadlock, connection exceptions.
                    code == "40001" || code == "40P01" || code.starts_with("08")
                })
                .unwrap_or(false);
            if transient {
                StoreError::Unavailable(err.to_string())
            } else {
                StoreError::Backend(err.to_string())
            }
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> StoreResult<T> {
    let value: serde_json::Value = row.try_get(column).map_err(map_err)?;
    serde_json::from_value(value)
        .map_err(|err| StoreError::Corrupt(format!("column {column}: {err}")))
}

fn configuration_from_row(row: &PgRow) -> StoreResult<Configuration> {
    Ok(Configuration {
        id: row.try_get("id").map_err(map_err)?,
        ssh_key: row.try_get("ssh_key").map_err(map_err)?,
        public_ssh_key: row.try_get("public_ssh_key").map_err(map_err)?,
        known_hosts: row.try_get("known_hosts").map_err(map_err)?,
        webhook_secret: row.try_get("webhook_secret").map_err(map_err)?,
        git_credentials: json_column(row, "git_credentials")?,
        docker_credentials: json_column(row, "docker_credentials")?,
    })
}

fn ecosystem_from_row(row: &PgRow) -> StoreResult<Ecosystem> {
    Ok(Ecosystem {
        id: row.try_get("id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        user: row.try_get("user").map_err(map_err)?,
        conan_config_url: row.try_get("conan_config_url").map_err(map_err)?,
        conan_config_path: row.try_get("conan_config_path").map_err(map_err)?,
        conan_config_branch: row.try_get("conan_config_branch").map_err(map_err)?,
        conan_credentials: json_column(row, "conan_credentials")?,
    })
}

fn repo_from_row(row: &PgRow) -> StoreResult<Repo> {
    Ok(Repo {
        id: row.try_get("id").map_err(map_err)?,
        ecosystem_id: row.try_get("ecosystem_id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        url: row.try_get("url").map_err(map_err)?,
        path: row.try_get("path").map_err(map_err)?,
        version: row.try_get("version").map_err(map_err)?,
        exclude: row.try_get("exclude").map_err(map_err)?,
        options: json_column(row, "options")?,
    })
}

fn channel_from_row(row: &PgRow) -> StoreResult<Channel> {
    Ok(Channel {
        id: row.try_get("id").map_err(map_err)?,
        ecosystem_id: row.try_get("ecosystem_id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        ref_pattern: row.try_get("ref_pattern").map_err(map_err)?,
        conan_channel: row.try_get("conan_channel").map_err(map_err)?,
    })
}

fn profile_from_row(row: &PgRow) -> StoreResult<Profile> {
    Ok(Profile {
        id: row.try_get("id").map_err(map_err)?,
        ecosystem_id: row.try_get("ecosystem_id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        platform: row.try_get::<String, _>("platform").map_err(map_err)?.parse()?,
        container: row.try_get("container").map_err(map_err)?,
        conan_profile: row.try_get("conan_profile").map_err(map_err)?,
        labels: row.try_get("labels").map_err(map_err)?,
    })
}

fn commit_from_row(row: &PgRow) -> StoreResult<Commit> {
    Ok(Commit {
        id: row.try_get("id").map_err(map_err)?,
        repo_id: row.try_get("repo_id").map_err(map_err)?,
        channel_id: row.try_get("channel_id").map_err(map_err)?,
        sha: row.try_get("sha").map_err(map_err)?,
        message: row.try_get("message").map_err(map_err)?,
        user_name: row.try_get("user_name").map_err(map_err)?,
        user_email: row.try_get("user_email").map_err(map_err)?,
        status: row.try_get::<String, _>("status").map_err(map_err)?.parse()?,
    })
}

fn build_from_row(row: &PgRow) -> StoreResult<Build> {
    Ok(Build {
        id: row.try_get("id").map_err(map_err)?,
        commit_id: row.try_get("commit_id").map_err(map_err)?,
        profile_id: row.try_get("profile_id").map_err(map_err)?,
        created: row.try_get("created").map_err(map_err)?,
        status: row.try_get::<String, _>("status").map_err(map_err)?.parse()?,
        package_id: row.try_get("package_id").map_err(map_err)?,
        recipe_revision_id: row.try_get("recipe_revision_id").map_err(map_err)?,
    })
}

fn recipe_from_row(row: &PgRow) -> StoreResult<Recipe> {
    Ok(Recipe {
        id: row.try_get("id").map_err(map_err)?,
        ecosystem_id: row.try_get("ecosystem_id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        version: row.try_get("version").map_err(map_err)?,
        user: row.try_get("user").map_err(map_err)?,
        channel: row.try_get("channel").map_err(map_err)?,
        current_revision_id: row.try_get("current_revision_id").map_err(map_err)?,
    })
}
