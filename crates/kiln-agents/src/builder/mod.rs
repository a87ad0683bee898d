//! Builder: owns exactly one container lifecycle.
//!
//! Not a worker — a scoped resource the agent creates per leased build and
//! drives through four phases: pull the image, render the build files,
//! set up the container, run it. Log lines stream into a bounded queue the
//! agent drains on its supervision tick; `cancel` closes the log stream,
//! which ends the run without failing it. Teardown stops and removes the
//! container best-effort.

pub mod archive;
pub mod engine;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;

use dataplane::model::{
    BuildOption, ConanCredential, DockerCredential, GitCredential, LeasedBuild, Platform,
};
use dataplane::output::BuildOutput;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::archive::{
    create_build_archive, extract_output_archive, render_conan_credentials, script_template,
    substitute, BUILD_OUTPUT_DIR_NAME, BUILD_PACKAGE_DIR_NAME,
};
use self::engine::{ContainerEngine, EngineError};

/// Bound on buffered, not-yet-persisted log lines.
const LOG_QUEUE_CAPACITY: usize = 4096;

/// Terminal failure of a build attempt. Cancellation is not a failure; a
/// cancelled run returns cleanly and the agent handles the stop.
#[derive(Debug, thiserror::Error)]
#[error("build failed: {message}")]
pub struct BuildError {
    pub message: String,
}

impl BuildError {
    pub fn failed(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<EngineError> for BuildError {
    fn from(err: EngineError) -> Self {
        Self::failed(err)
    }
}

/// Immutable snapshot of everything one build needs, collected inside the
/// lease transaction.
#[derive(Debug, Clone)]
pub struct BuildParameters {
    pub conan_config_url: String,
    pub conan_config_path: String,
    pub conan_config_branch: String,
    pub conan_credentials: Vec<ConanCredential>,
    pub conan_profile: String,
    /// Rendered `-o key=value …` options.
    pub conan_options: String,
    pub git_url: String,
    pub git_sha: String,
    pub git_credentials: Vec<GitCredential>,
    /// Base64-encoded.
    pub ssh_key: String,
    /// Base64-encoded.
    pub known_hosts: String,
    pub ecosystem_user: String,
    pub channel: String,
    pub version: String,
    /// `./conanfile.py`, or `./<repo path>/conanfile.py`.
    pub path: String,
    pub docker_credentials: Vec<DockerCredential>,
    pub mtu: u32,
}

impl BuildParameters {
    pub fn from_lease(lease: &LeasedBuild, mtu: u32) -> Self {
        let path = if lease.repo.path.is_empty() {
            "./conanfile.py".to_string()
        } else {
            format!("./{}/conanfile.py", lease.repo.path)
        };
        Self {
            conan_config_url: lease.ecosystem.conan_config_url.clone(),
            conan_config_path: lease.ecosystem.conan_config_path.clone(),
            conan_config_branch: lease.ecosystem.conan_config_branch.clone(),
            conan_credentials: lease.ecosystem.conan_credentials.clone(),
            conan_profile: lease.profile.conan_profile.clone(),
            conan_options: render_conan_options(&lease.repo.options),
            git_url: lease.repo.url.clone(),
            git_sha: lease.commit.sha.clone(),
            git_credentials: lease.configuration.git_credentials.clone(),
            ssh_key: lease.configuration.ssh_key.clone(),
            known_hosts: lease.configuration.known_hosts.clone(),
            ecosystem_user: lease.ecosystem.user.clone(),
            channel: lease.channel.conan_channel.clone(),
            version: lease.repo.version.clone(),
            path,
            docker_credentials: lease.configuration.docker_credentials.clone(),
            mtu,
        }
    }

    #[cfg(test)]
    pub(crate) fn example() -> Self {
        Self {
            conan_config_url: "https://example.com/conan-config.git".into(),
            conan_config_path: "default".into(),
            conan_config_branch: "main".into(),
            conan_credentials: vec![ConanCredential {
                remote: "default".into(),
                username: "kiln".into(),
                password: "secret".into(),
            }],
            conan_profile: "linux-gcc".into(),
            conan_options: "-o shared=True".into(),
            git_url: "git@example.com:acme/hello.git".into(),
            git_sha: "abc123".into(),
            git_credentials: vec![],
            ssh_key: String::new(),
            known_hosts: String::new(),
            ecosystem_user: "kiln".into(),
            channel: "stable".into(),
            version: "1.2.3".into(),
            path: "./conanfile.py".into(),
            docker_credentials: vec![],
            mtu: 1500,
        }
    }
}

/// Render repo options as conan command-line arguments.
pub fn render_conan_options(options: &[BuildOption]) -> String {
    options
        .iter()
        .map(|option| format!("-o {}={}", option.key, option.value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A parsed `((host(:port)?/)?repo)[:@]tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository including the registry host when present.
    pub repository: String,
    /// Registry host, empty for DockerHub.
    pub host: String,
    pub tag: String,
}

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(([a-z0-9-]+\.[a-z0-9.-]+(:[0-9]+)?/)?[a-z0-9./_-]+)[:@]([a-zA-Z0-9._-]+)$")
            .expect("valid pattern")
    })
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, BuildError> {
        let captures = image_pattern().captures(image).ok_or_else(|| {
            BuildError::failed(format!("'{image}' is not a valid container image name"))
        })?;
        Ok(Self {
            repository: captures.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
            host: captures
                .get(2)
                .map(|m| m.as_str().trim_end_matches('/'))
                .unwrap_or("")
                .to_string(),
            tag: captures.get(4).map(|m| m.as_str()).unwrap_or("").to_string(),
        })
    }
}

/// Per-platform filesystem layout inside the container.
fn build_package_dir(platform: Platform) -> String {
    match platform {
        Platform::Linux => format!("/{BUILD_PACKAGE_DIR_NAME}"),
        Platform::Windows => format!("C:\\{BUILD_PACKAGE_DIR_NAME}"),
    }
}

fn escaped_build_package_dir(platform: Platform) -> String {
    match platform {
        Platform::Linux => format!("/{BUILD_PACKAGE_DIR_NAME}"),
        Platform::Windows => format!("C:\\\\{BUILD_PACKAGE_DIR_NAME}"),
    }
}

fn build_output_dir(platform: Platform) -> String {
    match platform {
        Platform::Linux => format!("/tmp/{BUILD_OUTPUT_DIR_NAME}"),
        Platform::Windows => format!("C:\\{BUILD_OUTPUT_DIR_NAME}"),
    }
}

fn root_dir(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => "/",
        Platform::Windows => "C:\\",
    }
}

fn build_command(platform: Platform) -> Vec<String> {
    match platform {
        Platform::Linux => vec![
            "sh".to_string(),
            format!("{}/build.sh", build_package_dir(Platform::Linux)),
        ],
        Platform::Windows => vec![
            "cmd".to_string(),
            "/s".to_string(),
            "/c".to_string(),
            format!(
                "powershell -File {}\\build.ps1",
                build_package_dir(Platform::Windows)
            ),
        ],
    }
}

/// Assemble the substitution map for the platform script template.
pub(crate) fn template_parameters(
    platform: Platform,
    parameters: &BuildParameters,
) -> HashMap<&'static str, String> {
    let config_url = format!("{} --type=git", parameters.conan_config_url);
    let config_branch = if parameters.conan_config_branch.is_empty() {
        String::new()
    } else {
        format!("--args \"-b {}\"", parameters.conan_config_branch)
    };
    let config_path = if parameters.conan_config_path.is_empty() {
        String::new()
    } else {
        format!("-sf {}", parameters.conan_config_path)
    };
    let user_channel = if parameters.ecosystem_user.is_empty() {
        String::new()
    } else {
        format!("{}/{}", parameters.ecosystem_user, parameters.channel)
    };
    let create_reference = if parameters.version.is_empty() && user_channel.is_empty() {
        String::new()
    } else {
        format!("{}@{}", parameters.version, user_channel)
    };
    let lock_version = if parameters.version.is_empty() {
        String::new()
    } else {
        format!("--version {}", parameters.version)
    };
    let lock_user = if parameters.ecosystem_user.is_empty() {
        String::new()
    } else {
        format!(
            "--user {} --channel {}",
            parameters.ecosystem_user, parameters.channel
        )
    };

    HashMap::from([
        (
            "conan_config_args",
            join_args(&[&config_url, &config_branch, &config_path]),
        ),
        (
            "conan_credentials",
            render_conan_credentials(platform, &parameters.conan_credentials),
        ),
        ("conan_profile", parameters.conan_profile.clone()),
        ("conan_options", parameters.conan_options.clone()),
        ("create_reference", create_reference),
        ("lock_args", join_args(&[&lock_version, &lock_user])),
        ("git_url", parameters.git_url.clone()),
        ("git_sha", parameters.git_sha.clone()),
        ("path", parameters.path.clone()),
        ("build_package_dir", build_package_dir(platform)),
        (
            "escaped_build_package_dir",
            escaped_build_package_dir(platform),
        ),
        ("build_output_dir", build_output_dir(platform)),
        ("mtu", parameters.mtu.to_string()),
    ])
}

fn join_args(args: &[&str]) -> String {
    args.iter()
        .filter(|arg| !arg.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Builder<E: ContainerEngine> {
    engine: E,
    platform: Platform,
    image: String,
    container: StdMutex<Option<String>>,
    cancel: CancellationToken,
    log_tx: mpsc::Sender<String>,
    log_rx: StdMutex<mpsc::Receiver<String>>,
    output: StdMutex<BuildOutput>,
}

impl<E: ContainerEngine> Builder<E> {
    pub fn new(engine: E, platform: Platform, image: String) -> Self {
        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        Self {
            engine,
            platform,
            image,
            container: StdMutex::new(None),
            cancel: CancellationToken::new(),
            log_tx,
            log_rx: StdMutex::new(log_rx),
            output: StdMutex::new(BuildOutput::default()),
        }
    }

    /// All four phases in order.
    pub async fn run_phases(&self, parameters: &BuildParameters) -> Result<(), BuildError> {
        self.pull_image(parameters).await?;
        let archive = self.create_build_files(parameters)?;
        self.setup_container(archive).await?;
        self.run_build().await
    }

    /// Pull the configured image, unless its tag is `local`.
    pub async fn pull_image(&self, parameters: &BuildParameters) -> Result<(), BuildError> {
        let reference = ImageRef::parse(&self.image)?;
        if reference.tag == "local" {
            info!(image = self.image, "do not pull local image");
            return Ok(());
        }
        let auth = parameters
            .docker_credentials
            .iter()
            .find(|credential| credential.server == reference.host);
        info!(image = self.image, "pull image");
        self.engine
            .pull_image(&self.image, auth)
            .await
            .map_err(|err| {
                BuildError::failed(format!("failed to pull image '{}': {err}", self.image))
            })
    }

    /// Render the platform script and pack the build context tar.
    pub fn create_build_files(&self, parameters: &BuildParameters) -> Result<Vec<u8>, BuildError> {
        let script = substitute(
            script_template(self.platform),
            &template_parameters(self.platform, parameters),
        );
        create_build_archive(
            self.platform,
            &script,
            &parameters.git_credentials,
            &parameters.ssh_key,
            &parameters.known_hosts,
        )
    }

    /// Create the container and copy the build context into it.
    pub async fn setup_container(&self, archive: Vec<u8>) -> Result<(), BuildError> {
        let container = self
            .engine
            .create_container(&self.image, build_command(self.platform))
            .await
            .map_err(|err| {
                BuildError::failed(format!(
                    "failed to create container from image '{}': {err}",
                    self.image
                ))
            })?;
        info!(container, "created container");
        *self.container.lock().expect("container lock") = Some(container.clone());

        self.engine
            .put_archive(&container, root_dir(self.platform), archive)
            .await
            .map_err(|err| {
                BuildError::failed(format!(
                    "failed to copy build files to container '{container}': {err}"
                ))
            })
    }

    /// Start the container and stream its log until it stops or the build
    /// is cancelled; then collect the output files. A cancelled build
    /// returns `Ok` without output.
    pub async fn run_build(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            info!("build was cancelled");
            return Ok(());
        }
        let container = self.container_id()?;
        info!(container, "start build");
        self.engine
            .start_container(&container)
            .await
            .map_err(|err| BuildError::failed(format!("failed to start container: {err}")))?;
        let mut logs = self.engine.stream_logs(&container).await.map_err(|err| {
            BuildError::failed(format!("failed to open container log: {err}"))
        })?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("build was cancelled");
                    return Ok(());
                }
                line = futures::StreamExt::next(&mut logs) => match line {
                    Some(line) => {
                        // Backpressure: the agent drains this queue on its
                        // supervision tick.
                        let _ = self.log_tx.send(line).await;
                    }
                    None => break,
                },
            }
        }
        if self.cancel.is_cancelled() {
            info!("build was cancelled");
            return Ok(());
        }

        let status = self
            .engine
            .wait_container(&container)
            .await
            .map_err(|err| BuildError::failed(format!("failed to wait for container: {err}")))?;

        let output_archive = self
            .engine
            .get_archive(&container, &build_output_dir(self.platform))
            .await
            .map_err(|err| {
                BuildError::failed(format!(
                    "failed to obtain build output from container '{container}': {err}"
                ))
            })?;
        *self.output.lock().expect("output lock") = extract_output_archive(&output_archive)?;

        if status != 0 {
            return Err(BuildError::failed(format!(
                "build in container '{container}' returned status code '{status}'"
            )));
        }
        Ok(())
    }

    /// Mark the build cancelled and end the log stream.
    pub fn cancel(&self) {
        info!("cancel build");
        self.cancel.cancel();
    }

    /// Lines captured since the last drain.
    pub fn drain_log_lines(&self) -> Vec<String> {
        let mut receiver = self.log_rx.lock().expect("log queue lock");
        let mut lines = Vec::new();
        while let Ok(line) = receiver.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// The extracted output files; empty until `run_build` finished the
    /// extraction.
    pub fn build_output(&self) -> BuildOutput {
        self.output.lock().expect("output lock").clone()
    }

    /// Stop and remove the container; never fails the build path.
    pub async fn teardown(&self) {
        let container = self.container.lock().expect("container lock").take();
        let Some(container) = container else {
            return;
        };
        info!(container, "stop container");
        if let Err(err) = self.engine.stop_container(&container).await {
            warn!(container, error = %err, "failed to stop container");
        }
        info!(container, "remove container");
        if let Err(err) = self.engine.remove_container(&container).await {
            warn!(container, error = %err, "failed to remove container");
        }
    }

    fn container_id(&self) -> Result<String, BuildError> {
        self.container
            .lock()
            .expect("container lock")
            .clone()
            .ok_or_else(|| BuildError::failed("no container set up"))
    }
}

impl<E: ContainerEngine> Drop for Builder<E> {
    fn drop(&mut self) {
        // Backstop for dropped futures; the agent tears down explicitly.
        let container = self
            .container
            .lock()
            .ok()
            .and_then(|mut container| container.take());
        if let (Some(container), Ok(handle)) = (container, tokio::runtime::Handle::try_current()) {
            let engine = self.engine.clone();
            handle.spawn(async move {
                let _ = engine.stop_container(&container).await;
                let _ = engine.remove_container(&container).await;
            });
        }
    }
}
