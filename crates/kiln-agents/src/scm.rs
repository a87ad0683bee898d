//! Source-control boundary for the crawler.
//!
//! The crawler drives repositories through [`GitSource`] / [`RepoWorkspace`]
//! so its algorithm stays independent of the git library. [`Git2Source`] is
//! the production implementation; every blocking libgit2 call runs on the
//! blocking pool, and the repository handle is re-opened per operation.
//! [`testing::FakeGitSource`] scripts repository state for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine;
use dataplane::model::{truncate_column, GitCredential};
use regex::Regex;
use tracing::{debug, info};

/// Head metadata read after a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    /// First line of the message, truncated to the store column bound.
    pub message: String,
    pub user_name: String,
    pub user_email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid ref pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no checkout in workspace")]
    NoCheckout,
}

impl ScmError {
    pub fn git(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// Credentials a workspace materializes before fetching.
#[derive(Debug, Clone, Default)]
pub struct RepoAuth {
    /// Base64-encoded private key.
    pub ssh_key: String,
    /// Base64-encoded `known_hosts` content.
    pub known_hosts: String,
    pub git_credentials: Vec<GitCredential>,
}

/// Opens one checkout workspace per tracked repo.
#[async_trait]
pub trait GitSource: Send + Sync + 'static {
    type Workspace: RepoWorkspace + 'static;

    /// Ensure a working clone of `url` exists under `work_dir`, creating it
    /// when absent. An existing clone of a different URL is replaced.
    async fn open(&self, work_dir: PathBuf, url: String) -> Result<Self::Workspace, ScmError>;
}

/// One repo checkout the crawler walks channels over.
#[async_trait]
pub trait RepoWorkspace: Send + Sync {
    /// Write ssh key, known_hosts and credential helper into the work dir
    /// with owner-only permissions and point the repo config at them.
    async fn materialize_credentials(&self, auth: RepoAuth) -> Result<(), ScmError>;
    /// Fetch all remote heads and tags.
    async fn fetch(&self) -> Result<(), ScmError>;
    /// Check out an exact sha; `false` when the sha is unknown.
    async fn checkout_sha(&self, sha: String) -> Result<bool, ScmError>;
    /// Normalized refs (`heads/…`, `tags/…`) that full-match `pattern`.
    async fn matching_refs(&self, pattern: String) -> Result<Vec<String>, ScmError>;
    /// Check out one normalized ref returned by `matching_refs`.
    async fn checkout_ref(&self, normalized_ref: String) -> Result<(), ScmError>;
    /// Metadata of the current checkout.
    async fn head(&self) -> Result<CommitInfo, ScmError>;
    /// Whether `path` differs between the checkout and `past_sha`. An
    /// unknown past sha counts as a diff.
    async fn has_diff_since(&self, past_sha: String, path: String) -> Result<bool, ScmError>;
}

/// Compile a channel ref pattern as a full-match regex.
pub fn full_match_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Decode a base64 secret into text, tolerating stray whitespace.
pub fn decode_secret(encoded: &str) -> Result<String, ScmError> {
    let compact: String = encoded.split_whitespace().collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| ScmError::git("decode secret", err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Render the git credential helper script: for a `get` request whose host
/// matches one of the stored credential URLs it prints the
/// `username=…`/`password=…` pair.
pub fn build_credential_helper(credentials: &[GitCredential]) -> String {
    let mut script = String::from(
        "#!/bin/sh\n\
         test \"$1\" = get || exit 0\n\
         host=\"\"\n\
         while read line; do\n\
         \tcase \"$line\" in\n\
         \t\thost=*) host=\"${line#host=}\" ;;\n\
         \tesac\n\
         done\n\
         case \"$host\" in\n",
    );
    for credential in credentials {
        let host = host_of(&credential.url);
        if host.is_empty() {
            continue;
        }
        script.push_str(&format!(
            "\t{})\n\t\techo 'username={}'\n\t\techo 'password={}'\n\t\t;;\n",
            shell_quote_pattern(&host),
            shell_escape(&credential.username),
            shell_escape(&credential.password),
        ));
    }
    script.push_str("esac\n");
    script
}

/// Host (with optional port) of a credential URL.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.split_once('@').map(|(_, rest)| rest).unwrap_or(rest);
    rest.split('/').next().unwrap_or("").to_string()
}

fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

fn shell_quote_pattern(host: &str) -> String {
    format!("'{}'", shell_escape(host))
}

/// Production source backed by libgit2.
#[derive(Clone, Default)]
pub struct Git2Source;

impl Git2Source {
    pub fn new() -> Self {
        Self
    }
}

struct Git2State {
    work_dir: PathBuf,
    repo_dir: PathBuf,
    auth: RepoAuth,
}

/// Workspace over one on-disk clone; libgit2 calls run on the blocking pool.
pub struct Git2Workspace {
    state: Arc<StdMutex<Git2State>>,
}

#[async_trait]
impl GitSource for Git2Source {
    type Workspace = Git2Workspace;

    async fn open(&self, work_dir: PathBuf, url: String) -> Result<Git2Workspace, ScmError> {
        let state = blocking("open", move || {
            let repo_dir = work_dir.join("repo");
            if !is_clone_of(&repo_dir, &url) {
                info!(url, repo_dir = %repo_dir.display(), "create repo clone");
                let _ = std::fs::remove_dir_all(&repo_dir);
                std::fs::create_dir_all(&repo_dir)?;
                let repo = git2::Repository::init(&repo_dir)
                    .map_err(|err| ScmError::git("init", err))?;
                repo.remote("origin", &url)
                    .map_err(|err| ScmError::git("add remote", err))?;
            }
            Ok(Git2State {
                work_dir,
                repo_dir,
                auth: RepoAuth::default(),
            })
        })
        .await?;
        Ok(Git2Workspace {
            state: Arc::new(StdMutex::new(state)),
        })
    }
}

#[async_trait]
impl RepoWorkspace for Git2Workspace {
    async fn materialize_credentials(&self, auth: RepoAuth) -> Result<(), ScmError> {
        let state = Arc::clone(&self.state);
        blocking("materialize credentials", move || {
            let mut state = state.lock().expect("workspace lock");
            let ssh_key = decode_secret(&auth.ssh_key)?;
            let known_hosts = decode_secret(&auth.known_hosts)?;
            let key_path = state.work_dir.join("id_rsa");
            write_private(&key_path, &ssh_key, 0o600)?;
            let hosts_path = state.work_dir.join("known_hosts");
            write_private(&hosts_path, &known_hosts, 0o600)?;
            let helper_path = state.work_dir.join("credential_helper.sh");
            write_private(
                &helper_path,
                &build_credential_helper(&auth.git_credentials),
                0o700,
            )?;

            let repo = open_repo(&state.repo_dir)?;
            let mut config = repo
                .config()
                .map_err(|err| ScmError::git("open config", err))?;
            config
                .set_str(
                    "core.sshCommand",
                    &format!(
                        "ssh -i {} -o UserKnownHostsFile={}",
                        key_path.display(),
                        hosts_path.display()
                    ),
                )
                .map_err(|err| ScmError::git("set ssh command", err))?;
            config
                .set_str("credential.helper", &helper_path.display().to_string())
                .map_err(|err| ScmError::git("set credential helper", err))?;

            state.auth = auth;
            Ok(())
        })
        .await
    }

    async fn fetch(&self) -> Result<(), ScmError> {
        let state = Arc::clone(&self.state);
        blocking("fetch", move || {
            let state = state.lock().expect("workspace lock");
            let repo = open_repo(&state.repo_dir)?;
            let mut remote = repo
                .find_remote("origin")
                .map_err(|err| ScmError::git("find remote", err))?;
            let mut options = git2::FetchOptions::new();
            options.remote_callbacks(remote_callbacks(&state));
            remote
                .fetch(
                    &[
                        "+refs/heads/*:refs/remotes/origin/*",
                        "+refs/tags/*:refs/tags/*",
                    ],
                    Some(&mut options),
                    None,
                )
                .map_err(|err| ScmError::git("fetch", err))?;
            Ok(())
        })
        .await
    }

    async fn checkout_sha(&self, sha: String) -> Result<bool, ScmError> {
        let state = Arc::clone(&self.state);
        blocking("checkout sha", move || {
            let state = state.lock().expect("workspace lock");
            let repo = open_repo(&state.repo_dir)?;
            let object = match repo.revparse_single(&sha) {
                Ok(object) => object,
                Err(_) => return Ok(false),
            };
            repo.reset(&object, git2::ResetType::Hard, None)
                .map_err(|err| ScmError::git("reset", err))?;
            Ok(true)
        })
        .await
    }

    async fn matching_refs(&self, pattern: String) -> Result<Vec<String>, ScmError> {
        let state = Arc::clone(&self.state);
        blocking("list refs", move || {
            let state = state.lock().expect("workspace lock");
            let matcher = full_match_pattern(&pattern)?;
            let repo = open_repo(&state.repo_dir)?;
            let mut matching = Vec::new();
            let references = repo
                .references()
                .map_err(|err| ScmError::git("list refs", err))?;
            for reference in references.flatten() {
                let Some(name) = reference.name() else {
                    continue;
                };
                let Some(normalized) = normalize_ref(name) else {
                    continue;
                };
                if matcher.is_match(&normalized) {
                    matching.push(normalized);
                }
            }
            matching.sort();
            matching.dedup();
            Ok(matching)
        })
        .await
    }

    async fn checkout_ref(&self, normalized_ref: String) -> Result<(), ScmError> {
        let state = Arc::clone(&self.state);
        blocking("checkout ref", move || {
            let state = state.lock().expect("workspace lock");
            let repo = open_repo(&state.repo_dir)?;
            let full_name = denormalize_ref(&normalized_ref)
                .ok_or_else(|| ScmError::git("checkout ref", "unknown ref form"))?;
            let reference = repo
                .find_reference(&full_name)
                .map_err(|err| ScmError::git("find ref", err))?;
            let commit = reference
                .peel_to_commit()
                .map_err(|err| ScmError::git("peel ref", err))?;
            repo.reset(commit.as_object(), git2::ResetType::Hard, None)
                .map_err(|err| ScmError::git("reset", err))?;
            debug!(ref_name = normalized_ref, "checked out");
            Ok(())
        })
        .await
    }

    async fn head(&self) -> Result<CommitInfo, ScmError> {
        let state = Arc::clone(&self.state);
        blocking("read head", move || {
            let state = state.lock().expect("workspace lock");
            let repo = open_repo(&state.repo_dir)?;
            let commit = repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .map_err(|err| ScmError::git("read head", err))?;
            let message = commit
                .message()
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("");
            let author = commit.author();
            Ok(CommitInfo {
                sha: commit.id().to_string(),
                message: truncate_column(message),
                user_name: truncate_column(author.name().unwrap_or("")),
                user_email: truncate_column(author.email().unwrap_or("")),
            })
        })
        .await
    }

    async fn has_diff_since(&self, past_sha: String, path: String) -> Result<bool, ScmError> {
        let state = Arc::clone(&self.state);
        blocking("diff", move || {
            let state = state.lock().expect("workspace lock");
            let repo = open_repo(&state.repo_dir)?;
            let head = repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .map_err(|err| ScmError::git("read head", err))?;
            let past = match repo
                .revparse_single(&past_sha)
                .and_then(|object| object.peel_to_commit())
            {
                Ok(commit) => commit,
                Err(_) => {
                    // The recorded sha may have been rewritten away; treat
                    // it as changed so the commit is not silently skipped.
                    debug!(past_sha, "past commit unknown, assume a diff");
                    return Ok(true);
                }
            };
            let head_tree = head.tree().map_err(|err| ScmError::git("head tree", err))?;
            let past_tree = past.tree().map_err(|err| ScmError::git("past tree", err))?;
            let diff = repo
                .diff_tree_to_tree(Some(&past_tree), Some(&head_tree), None)
                .map_err(|err| ScmError::git("diff", err))?;
            for delta in diff.deltas() {
                for file in [delta.old_file(), delta.new_file()] {
                    if let Some(file_path) = file.path() {
                        if file_path.starts_with(&path) {
                            return Ok(true);
                        }
                    }
                }
            }
            Ok(false)
        })
        .await
    }
}

async fn blocking<T, F>(operation: &'static str, f: F) -> Result<T, ScmError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ScmError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ScmError::git(operation, err))?
}

fn open_repo(repo_dir: &Path) -> Result<git2::Repository, ScmError> {
    git2::Repository::open(repo_dir).map_err(|err| ScmError::git("open repo", err))
}

fn is_clone_of(repo_dir: &Path, url: &str) -> bool {
    let Ok(repo) = git2::Repository::open(repo_dir) else {
        return false;
    };
    let Ok(remote) = repo.find_remote("origin") else {
        return false;
    };
    remote.url() == Some(url)
}

fn remote_callbacks(state: &Git2State) -> git2::RemoteCallbacks<'static> {
    let key_path = state.work_dir.join("id_rsa");
    let credentials = state.auth.git_credentials.clone();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.contains(git2::CredentialType::SSH_KEY) {
            let username = username_from_url.unwrap_or("git");
            return git2::Cred::ssh_key(username, None, &key_path, None);
        }
        if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
            let host = host_of(url);
            if let Some(credential) = credentials
                .iter()
                .find(|credential| host_of(&credential.url) == host)
            {
                return git2::Cred::userpass_plaintext(&credential.username, &credential.password);
            }
        }
        git2::Cred::default()
    });
    callbacks.certificate_check(|_, _| Ok(git2::CertificateCheckStatus::CertificatePassthrough));
    callbacks
}

/// `refs/remotes/origin/X` → `heads/X`, `refs/tags/X` → `tags/X`.
fn normalize_ref(name: &str) -> Option<String> {
    if let Some(branch) = name.strip_prefix("refs/remotes/origin/") {
        if branch == "HEAD" {
            return None;
        }
        return Some(format!("heads/{branch}"));
    }
    name.strip_prefix("refs/tags/")
        .map(|tag| format!("tags/{tag}"))
}

fn denormalize_ref(normalized: &str) -> Option<String> {
    if let Some(branch) = normalized.strip_prefix("heads/") {
        return Some(format!("refs/remotes/origin/{branch}"));
    }
    normalized
        .strip_prefix("tags/")
        .map(|tag| format!("refs/tags/{tag}"))
}

fn write_private(path: &Path, content: &str, mode: u32) -> Result<(), ScmError> {
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Scripted in-memory source for worker tests.
pub mod testing {
    use super::*;

    /// One scripted ref and the head it checks out to.
    #[derive(Debug, Clone)]
    pub struct FakeRef {
        pub normalized: String,
        pub head: CommitInfo,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeRepoState {
        pub refs: Vec<FakeRef>,
        /// Error every fetch with this message.
        pub fetch_error: Option<String>,
        /// `(past_sha, path)` → has-diff answer; unknown pairs answer true.
        pub diffs: HashMap<(String, String), bool>,
    }

    /// Fake [`GitSource`] keyed by repo URL.
    #[derive(Clone, Default)]
    pub struct FakeGitSource {
        repos: Arc<StdMutex<HashMap<String, FakeRepoState>>>,
    }

    impl FakeGitSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_repo(&self, url: &str, state: FakeRepoState) {
            self.repos
                .lock()
                .expect("fake repos lock")
                .insert(url.to_string(), state);
        }
    }

    pub struct FakeWorkspace {
        url: String,
        repos: Arc<StdMutex<HashMap<String, FakeRepoState>>>,
        checked_out: StdMutex<Option<CommitInfo>>,
    }

    impl FakeWorkspace {
        fn state(&self) -> Result<FakeRepoState, ScmError> {
            self.repos
                .lock()
                .expect("fake repos lock")
                .get(&self.url)
                .cloned()
                .ok_or_else(|| ScmError::git("open", format!("unknown repo {}", self.url)))
        }
    }

    #[async_trait]
    impl GitSource for FakeGitSource {
        type Workspace = FakeWorkspace;

        async fn open(&self, _work_dir: PathBuf, url: String) -> Result<FakeWorkspace, ScmError> {
            Ok(FakeWorkspace {
                url,
                repos: Arc::clone(&self.repos),
                checked_out: StdMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl RepoWorkspace for FakeWorkspace {
        async fn materialize_credentials(&self, _auth: RepoAuth) -> Result<(), ScmError> {
            Ok(())
        }

        async fn fetch(&self) -> Result<(), ScmError> {
            match self.state()?.fetch_error {
                Some(message) => Err(ScmError::git("fetch", message)),
                None => Ok(()),
            }
        }

        async fn checkout_sha(&self, sha: String) -> Result<bool, ScmError> {
            let state = self.state()?;
            let found = state.refs.iter().find(|r| r.head.sha == sha);
            match found {
                Some(r) => {
                    *self.checked_out.lock().expect("checkout lock") = Some(r.head.clone());
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn matching_refs(&self, pattern: String) -> Result<Vec<String>, ScmError> {
            let matcher = full_match_pattern(&pattern)?;
            Ok(self
                .state()?
                .refs
                .iter()
                .map(|r| r.normalized.clone())
                .filter(|name| matcher.is_match(name))
                .collect())
        }

        async fn checkout_ref(&self, normalized_ref: String) -> Result<(), ScmError> {
            let state = self.state()?;
            let found = state
                .refs
                .iter()
                .find(|r| r.normalized == normalized_ref)
                .ok_or_else(|| ScmError::git("checkout", "unknown ref"))?;
            *self.checked_out.lock().expect("checkout lock") = Some(found.head.clone());
            Ok(())
        }

        async fn head(&self) -> Result<CommitInfo, ScmError> {
            self.checked_out
                .lock()
                .expect("checkout lock")
                .clone()
                .ok_or(ScmError::NoCheckout)
        }

        async fn has_diff_since(&self, past_sha: String, path: String) -> Result<bool, ScmError> {
            Ok(self
                .state()?
                .diffs
                .get(&(past_sha, path))
                .copied()
                .unwrap_or(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_normalization_round_trips() {
        assert_eq!(
            normalize_ref("refs/remotes/origin/main").as_deref(),
            Some("heads/main")
        );
        assert_eq!(
            normalize_ref("refs/tags/v1.2").as_deref(),
            Some("tags/v1.2")
        );
        assert_eq!(normalize_ref("refs/remotes/origin/HEAD"), None);
        assert_eq!(normalize_ref("refs/stash"), None);

        assert_eq!(
            denormalize_ref("heads/main").as_deref(),
            Some("refs/remotes/origin/main")
        );
        assert_eq!(
            denormalize_ref("tags/v1.2").as_deref(),
            Some("refs/tags/v1.2")
        );
        assert_eq!(denormalize_ref("weird/x"), None);
    }

    #[test]
    fn full_match_is_anchored() {
        let matcher = full_match_pattern("heads/mai.*").unwrap();
        assert!(matcher.is_match("heads/main"));
        assert!(!matcher.is_match("xheads/main"));
        let matcher = full_match_pattern("heads/maste").unwrap();
        assert!(!matcher.is_match("heads/master"));
    }

    #[test]
    fn credential_helper_matches_hosts() {
        let script = build_credential_helper(&[GitCredential {
            url: "https://user@git.example.com:8443/acme".to_string(),
            username: "builder".to_string(),
            password: "s3cr'et".to_string(),
        }]);
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("'git.example.com:8443')"));
        assert!(script.contains("username=builder"));
        assert!(script.contains("password=s3cr'\\''et"));
    }

    #[test]
    fn secret_decoding_tolerates_whitespace() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("hello\nworld");
        let wrapped = format!("{}\n{}", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_secret(&wrapped).unwrap(), "hello\nworld");
        assert!(decode_secret("not base64!!").is_err());
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://github.com/acme/x"), "github.com");
        assert_eq!(host_of("https://u:p@example.com:8080/y"), "example.com:8080");
        assert_eq!(host_of("git@github.com:acme/x.git"), "github.com:acme");
    }

    #[tokio::test]
    async fn fake_workspace_scripts_refs_and_diffs() {
        use testing::*;

        let source = FakeGitSource::new();
        source.put_repo(
            "url",
            FakeRepoState {
                refs: vec![FakeRef {
                    normalized: "heads/main".to_string(),
                    head: CommitInfo {
                        sha: "abc".to_string(),
                        message: "m".to_string(),
                        user_name: "n".to_string(),
                        user_email: "e".to_string(),
                    },
                }],
                fetch_error: None,
                diffs: HashMap::from([(("old".to_string(), "lib".to_string()), false)]),
            },
        );
        let workspace = source
            .open(PathBuf::from("/tmp"), "url".to_string())
            .await
            .unwrap();
        workspace.fetch().await.unwrap();
        let refs = workspace
            .matching_refs("heads/.*".to_string())
            .await
            .unwrap();
        assert_eq!(refs, vec!["heads/main"]);
        workspace
            .checkout_ref("heads/main".to_string())
            .await
            .unwrap();
        assert_eq!(workspace.head().await.unwrap().sha, "abc");
        assert!(!workspace
            .has_diff_since("old".to_string(), "lib".to_string())
            .await
            .unwrap());
        assert!(workspace
            .has_diff_since("unknown".to_string(), "lib".to_string())
            .await
            .unwrap());
    }
}
