//! Container engine boundary.
//!
//! The builder drives containers through [`ContainerEngine`];
//! [`DockerEngine`] implements it with bollard, and
//! [`testing::FakeEngine`] scripts container behavior for tests.

use async_trait::async_trait;
use dataplane::model::DockerCredential;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// One container engine client. Implementations are cheap to clone.
#[async_trait]
pub trait ContainerEngine: Clone + Send + Sync + 'static {
    /// Pull `image`, authenticating with `auth` when given.
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&DockerCredential>,
    ) -> Result<(), EngineError>;

    /// Create a container running `command`; returns its id.
    async fn create_container(
        &self,
        image: &str,
        command: Vec<String>,
    ) -> Result<String, EngineError>;

    /// Unpack a tar archive at `path` inside the container.
    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError>;

    async fn start_container(&self, container: &str) -> Result<(), EngineError>;

    /// Follow the container's output as decoded lines. The stream ends when
    /// the container stops.
    async fn stream_logs(&self, container: &str) -> Result<BoxStream<'static, String>, EngineError>;

    /// Wait for the container to exit; returns its status code.
    async fn wait_container(&self, container: &str) -> Result<i64, EngineError>;

    /// Fetch `path` from the container as a tar archive.
    async fn get_archive(&self, container: &str, path: &str) -> Result<Vec<u8>, EngineError>;

    async fn stop_container(&self, container: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, container: &str) -> Result<(), EngineError>;
}

/// Split a byte-chunk stream into lossy-decoded lines. Builder output may
/// contain arbitrary bytes; invalid UTF-8 becomes replacement characters
/// and a trailing unterminated line is flushed when the stream ends.
pub fn lines_from_chunks(
    chunks: BoxStream<'static, Vec<u8>>,
) -> BoxStream<'static, String> {
    struct State {
        chunks: BoxStream<'static, Vec<u8>>,
        buffer: Vec<u8>,
        done: bool,
    }

    fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
        let position = buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = buffer.drain(..=position).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    let state = State {
        chunks,
        buffer: Vec::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = take_line(&mut state.buffer) {
                return Some((line, state));
            }
            if state.done {
                if state.buffer.is_empty() {
                    return None;
                }
                let rest = String::from_utf8_lossy(&state.buffer).into_owned();
                state.buffer.clear();
                return Some((rest, state));
            }
            match state.chunks.next().await {
                Some(chunk) => state.buffer.extend_from_slice(&chunk),
                None => state.done = true,
            }
        }
    })
    .boxed()
}

/// Production engine backed by the local docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: bollard::Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|err| EngineError::new(format!("failed to reach docker: {err}")))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&DockerCredential>,
    ) -> Result<(), EngineError> {
        let (repository, tag) = image
            .rsplit_once([':', '@'])
            .ok_or_else(|| EngineError::new(format!("image '{image}' has no tag")))?;
        let options = bollard::image::CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let credentials = auth.map(|credential| bollard::auth::DockerCredentials {
            username: Some(credential.username.clone()),
            password: Some(credential.password.clone()),
            serveraddress: if credential.server.is_empty() {
                None
            } else {
                Some(credential.server.clone())
            },
            ..Default::default()
        });
        let mut progress = self.docker.create_image(Some(options), None, credentials);
        while let Some(step) = progress.next().await {
            let info = step.map_err(EngineError::new)?;
            if let Some(status) = info.status {
                debug!(image, status, "pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        image: &str,
        command: Vec<String>,
    ) -> Result<String, EngineError> {
        let config = bollard::container::Config {
            image: Some(image.to_string()),
            cmd: Some(command),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<bollard::container::CreateContainerOptions<String>>, config)
            .await
            .map_err(EngineError::new)?;
        Ok(created.id)
    }

    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let options = bollard::container::UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container, Some(options), archive.into())
            .await
            .map_err(EngineError::new)
    }

    async fn start_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(container, None::<bollard::container::StartContainerOptions<String>>)
            .await
            .map_err(EngineError::new)
    }

    async fn stream_logs(&self, container: &str) -> Result<BoxStream<'static, String>, EngineError> {
        let options = bollard::container::LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let chunks = self
            .docker
            .logs(container, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(output) => Some(output.into_bytes().to_vec()),
                    Err(_) => None,
                }
            })
            .boxed();
        Ok(lines_from_chunks(chunks))
    }

    async fn wait_container(&self, container: &str) -> Result<i64, EngineError> {
        let mut wait = self
            .docker
            .wait_container(container, None::<bollard::container::WaitContainerOptions<String>>);
        let mut status = 0;
        while let Some(step) = wait.next().await {
            match step {
                Ok(response) => status = response.status_code,
                // A non-zero exit surfaces as an error item carrying the
                // status; the status check happens on the extracted value.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    status = code;
                }
                Err(err) => return Err(EngineError::new(err)),
            }
        }
        Ok(status)
    }

    async fn get_archive(&self, container: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let options = bollard::container::DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(EngineError::new)?);
        }
        Ok(archive)
    }

    async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(container, None::<bollard::container::StopContainerOptions>)
            .await
            .map_err(EngineError::new)
    }

    async fn remove_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(container, None::<bollard::container::RemoveContainerOptions>)
            .await
            .map_err(EngineError::new)
    }
}

/// Scripted engine for tests.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Scripted behavior of the one container a test builder creates.
    #[derive(Debug, Clone, Default)]
    pub struct FakeContainer {
        pub log_lines: Vec<String>,
        /// Keep the log stream open after the scripted lines; the build
        /// only ends via cancel. Models a never-returning conanfile.
        pub hold_logs: bool,
        pub exit_code: i64,
        /// Tar bytes returned for the output directory.
        pub output_archive: Vec<u8>,
    }

    #[derive(Debug, Default)]
    pub struct FakeEngineState {
        pub container: FakeContainer,
        pub pull_error: Option<String>,
        pub pulled: Vec<(String, Option<String>)>,
        pub created: Vec<(String, Vec<String>)>,
        pub uploads: HashMap<String, Vec<u8>>,
        pub started: Vec<String>,
        pub stopped: Vec<String>,
        pub removed: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct FakeEngine {
        state: Arc<StdMutex<FakeEngineState>>,
    }

    impl FakeEngine {
        pub fn new(container: FakeContainer) -> Self {
            let engine = Self::default();
            engine.state.lock().expect("fake engine lock").container = container;
            engine
        }

        pub fn with_pull_error(self, message: &str) -> Self {
            self.state.lock().expect("fake engine lock").pull_error = Some(message.to_string());
            self
        }

        /// Swap the scripted container; the next build sees the new one.
        pub fn set_container(&self, container: FakeContainer) {
            self.state.lock().expect("fake engine lock").container = container;
        }

        pub fn snapshot<R>(&self, f: impl FnOnce(&FakeEngineState) -> R) -> R {
            f(&self.state.lock().expect("fake engine lock"))
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn pull_image(
            &self,
            image: &str,
            auth: Option<&DockerCredential>,
        ) -> Result<(), EngineError> {
            let mut state = self.state.lock().expect("fake engine lock");
            if let Some(message) = &state.pull_error {
                return Err(EngineError::new(message));
            }
            state
                .pulled
                .push((image.to_string(), auth.map(|a| a.username.clone())));
            Ok(())
        }

        async fn create_container(
            &self,
            image: &str,
            command: Vec<String>,
        ) -> Result<String, EngineError> {
            let mut state = self.state.lock().expect("fake engine lock");
            state.created.push((image.to_string(), command));
            Ok(format!("container-{}", state.created.len()))
        }

        async fn put_archive(
            &self,
            container: &str,
            _path: &str,
            archive: Vec<u8>,
        ) -> Result<(), EngineError> {
            self.state
                .lock()
                .expect("fake engine lock")
                .uploads
                .insert(container.to_string(), archive);
            Ok(())
        }

        async fn start_container(&self, container: &str) -> Result<(), EngineError> {
            self.state
                .lock()
                .expect("fake engine lock")
                .started
                .push(container.to_string());
            Ok(())
        }

        async fn stream_logs(
            &self,
            _container: &str,
        ) -> Result<BoxStream<'static, String>, EngineError> {
            let container = self
                .state
                .lock()
                .expect("fake engine lock")
                .container
                .clone();
            let lines = futures::stream::iter(container.log_lines);
            if container.hold_logs {
                Ok(lines.chain(futures::stream::pending()).boxed())
            } else {
                Ok(lines.boxed())
            }
        }

        async fn wait_container(&self, _container: &str) -> Result<i64, EngineError> {
            Ok(self
                .state
                .lock()
                .expect("fake engine lock")
                .container
                .exit_code)
        }

        async fn get_archive(&self, _container: &str, _path: &str) -> Result<Vec<u8>, EngineError> {
            Ok(self
                .state
                .lock()
                .expect("fake engine lock")
                .container
                .output_archive
                .clone())
        }

        async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
            self.state
                .lock()
                .expect("fake engine lock")
                .stopped
                .push(container.to_string());
            Ok(())
        }

        async fn remove_container(&self, container: &str) -> Result<(), EngineError> {
            self.state
                .lock()
                .expect("fake engine lock")
                .removed
                .push(container.to_string());
            Ok(())
        }
    }
}
