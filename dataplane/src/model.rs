//! Entity rows and status state machines.
//!
//! The on-disk spelling of every status enum is its lowercased name; external
//! consumers match on the exact strings, so the `as_str`/`parse` pairs here
//! are the single source of truth for them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifier used by every table.
pub type Id = i64;

/// Store-enforced bound on short text columns; commit metadata is
/// truncated to this length on insert.
pub const TEXT_COLUMN_MAX: usize = 255;

/// Truncate a string to [`TEXT_COLUMN_MAX`] characters on a char boundary.
pub fn truncate_column(value: &str) -> String {
    value.chars().take(TEXT_COLUMN_MAX).collect()
}

/// Error returned when a status string read from the store is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct InvalidStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// The exact spelling persisted in the store and published on the bus.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = InvalidStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(InvalidStatus { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

status_enum!(
    /// Build platform a profile targets and an agent serves.
    Platform, "platform", {
        Linux => "linux",
        Windows => "windows",
    }
);

impl Platform {
    /// Parse the `KILN_AGENT_PLATFORM` environment spelling (`Linux`/`Windows`).
    pub fn from_env_value(value: &str) -> Result<Self, InvalidStatus> {
        match value {
            "Linux" => Ok(Self::Linux),
            "Windows" => Ok(Self::Windows),
            other => other.parse(),
        }
    }
}

status_enum!(
    /// Lifecycle of a crawled commit.
    ///
    /// `new` commits await scheduling, `building` commits have builds fanned
    /// out, and a commit turns `old` only when a newer commit on the same
    /// (repo, channel) supersedes it. Commits are never deleted.
    CommitStatus, "commit status", {
        New => "new",
        Building => "building",
        Old => "old",
    }
);

status_enum!(
    /// Build state machine.
    ///
    /// `new → active → (success|error)`, `new → stopped`,
    /// `(new|active) → stopping → stopped`, and `error → new` when the
    /// result manager or watchdog unblocks the build.
    BuildStatus, "build status", {
        New => "new",
        Active => "active",
        Error => "error",
        Success => "success",
        Stopping => "stopping",
        Stopped => "stopped",
    }
);

impl BuildStatus {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (New, Active)
                | (Active, Success)
                | (Active, Error)
                | (New, Stopped)
                | (New, Stopping)
                | (Active, Stopping)
                | (Stopping, Stopped)
                | (Error, New)
                // Watchdog and agent cleanup relaunch an abandoned build.
                | (Active, New)
        )
    }
}

status_enum!(
    /// State of one execution attempt of a build.
    RunStatus, "run status", {
        Active => "active",
        Stalled => "stalled",
        Success => "success",
        Error => "error",
        Stopped => "stopped",
    }
);

/// A conan remote login used inside the build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConanCredential {
    pub remote: String,
    pub username: String,
    pub password: String,
}

/// An HTTP(S) git credential served by the generated credential helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredential {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// A registry login for pulling build images. An empty `server` means
/// DockerHub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerCredential {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// A `-o key=value` conan option configured on a repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOption {
    pub key: String,
    pub value: String,
}

/// Top-level grouping of repos, channels, profiles and recipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    pub id: Id,
    pub name: String,
    /// Conan user the ecosystem publishes under.
    pub user: String,
    pub conan_config_url: String,
    pub conan_config_path: String,
    pub conan_config_branch: String,
    pub conan_credentials: Vec<ConanCredential>,
}

/// Process-wide singleton carrying the credentials the workers materialize
/// into files: exactly one row exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub id: Id,
    /// Base64-encoded private key.
    pub ssh_key: String,
    /// Base64-encoded public key, exposed for registration with git hosts.
    pub public_ssh_key: String,
    /// Base64-encoded `known_hosts` content.
    pub known_hosts: String,
    /// Shared secret push webhooks are signed with.
    pub webhook_secret: String,
    pub git_credentials: Vec<GitCredential>,
    pub docker_credentials: Vec<DockerCredential>,
}

/// A tracked source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: Id,
    pub ecosystem_id: Id,
    pub name: String,
    pub url: String,
    /// Sub-directory holding the conanfile; empty means the repo root.
    pub path: String,
    /// Version override passed to `conan create`; empty means none.
    pub version: String,
    /// Label values excluding profiles from building this repo.
    pub exclude: Vec<String>,
    pub options: Vec<BuildOption>,
}

/// Maps a regex over normalized git refs (`heads/…`, `tags/…`) to a conan
/// channel string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Id,
    pub ecosystem_id: Id,
    pub name: String,
    pub ref_pattern: String,
    pub conan_channel: String,
}

/// A named build environment: platform, container image and conan profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Id,
    pub ecosystem_id: Id,
    pub name: String,
    pub platform: Platform,
    /// Container image reference, `((host(:port)?/)?repo)[:@]tag`.
    pub container: String,
    pub conan_profile: String,
    pub labels: Vec<String>,
}

/// A durable record of a crawled commit on one (repo, channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: Id,
    pub repo_id: Id,
    pub channel_id: Id,
    pub sha: String,
    pub message: String,
    pub user_name: String,
    pub user_email: String,
    pub status: CommitStatus,
}

/// Fields of a commit row the crawler inserts.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub repo_id: Id,
    pub channel_id: Id,
    pub sha: String,
    pub message: String,
    pub user_name: String,
    pub user_email: String,
}

/// A scheduled attempt to produce a package from a commit under a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: Id,
    pub commit_id: Id,
    pub profile_id: Id,
    pub created: DateTime<Utc>,
    pub status: BuildStatus,
    /// Package produced by the build, once known.
    pub package_id: Option<Id>,
    /// Partial reference data recorded when a failed build produced a
    /// recipe revision but no package.
    pub recipe_revision_id: Option<Id>,
}

/// One execution attempt of a build; append-only, one per agent lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: Id,
    pub build_id: Id,
    pub started: DateTime<Utc>,
    /// Monotonic per run; the watchdog treats staleness here as a stall.
    pub updated: DateTime<Utc>,
    pub status: RunStatus,
}

/// A single captured line of builder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub id: Id,
    pub run_id: Id,
    /// Dense 1-based sequence number within the run.
    pub number: i64,
    pub time: DateTime<Utc>,
    pub content: String,
}

/// A build specification identified by (name, version, user?, channel?)
/// within an ecosystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub id: Id,
    pub ecosystem_id: Id,
    pub name: String,
    pub version: String,
    pub user: Option<String>,
    pub channel: Option<String>,
    /// Revision most recently produced by a build of a `building` commit.
    pub current_revision_id: Option<Id>,
}

/// A content hash of one recipe snapshot. The revision string may be empty
/// when the conan cache does not expose revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeRevision {
    pub id: Id,
    pub recipe_id: Id,
    pub revision: String,
}

/// A binary produced by a recipe revision for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: Id,
    pub recipe_revision_id: Id,
    /// The conan package id string (not a row id).
    pub package_id: String,
}

/// Everything an agent snapshots when it leases a build; gathered inside
/// the lease transaction so the builder never touches the store.
#[derive(Debug, Clone)]
pub struct LeasedBuild {
    pub build: Build,
    pub run_id: Id,
    pub commit: Commit,
    pub repo: Repo,
    pub channel: Channel,
    pub profile: Profile,
    pub ecosystem: Ecosystem,
    pub configuration: Configuration,
}

/// A run the watchdog considers stalled, joined with its build's status.
#[derive(Debug, Clone)]
pub struct StalledRun {
    pub run_id: Id,
    pub build_id: Id,
    pub build_status: BuildStatus,
}
