use crate::dockerfile;
use crate::image_config::ImageConfiguration;
use crate::image_reference::{ImageReference, ParseError};
use crate::pull::PullDecision;
use crate::secret_string::SecretString;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Credentials for the registry base images are pulled from.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}

/// Build time parameters, handed to the engine unmodified.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub context_dir: PathBuf,
    /// Where rendered Dockerfiles are written.
    pub work_dir: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub no_cache: bool,
    pub registry_auth: Option<RegistryAuth>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to prepare build directory {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
    #[error("image {0} has no build configuration")]
    MissingBuildConfiguration(String),
    #[error("failed to record pull of base image: {0}")]
    PullRecord(#[from] crate::cache::CacheAccessError),
}

#[derive(Debug, Error)]
pub enum TagError {
    #[error("invalid image name {name}: {source}")]
    InvalidName { name: String, source: ParseError },
    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Performs the actual image build and tag operations.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Builds `image`, fetching its base image first when `pull` requires it.
    async fn build_image(
        &self,
        image: &ImageConfiguration,
        pull: &PullDecision<'_>,
        context: &BuildContext,
    ) -> Result<(), BuildError>;

    /// Applies the additional tags of `image` to the freshly built `name`.
    async fn tag_image(&self, name: &str, image: &ImageConfiguration) -> Result<(), TagError>;
}

/// Engine driving a docker compatible command line (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct DockerCliEngine {
    command: String,
}

struct CommandFailure {
    command: String,
    kind: CommandFailureKind,
}

enum CommandFailureKind {
    Spawn(io::Error),
    Status { status: String, stderr: String },
}

impl From<CommandFailure> for BuildError {
    fn from(failure: CommandFailure) -> Self {
        let command = failure.command;
        match failure.kind {
            CommandFailureKind::Spawn(source) => BuildError::Spawn { command, source },
            CommandFailureKind::Status { status, stderr } => BuildError::Failed {
                command,
                status,
                stderr,
            },
        }
    }
}

impl From<CommandFailure> for TagError {
    fn from(failure: CommandFailure) -> Self {
        let command = failure.command;
        match failure.kind {
            CommandFailureKind::Spawn(source) => TagError::Spawn { command, source },
            CommandFailureKind::Status { status, stderr } => TagError::Failed {
                command,
                status,
                stderr,
            },
        }
    }
}

impl DockerCliEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<(), CommandFailure> {
        let command_line = format!("{} {}", self.command, args.join(" "));
        let failure = |kind| CommandFailure {
            command: format!("{} {}", self.command, args.first().map_or("", |a| a.as_str())),
            kind,
        };
        debug!("Running {}", command_line);

        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(CommandFailureKind::Spawn(e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| failure(CommandFailureKind::Spawn(e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failure(CommandFailureKind::Spawn(e)))?;
        if !output.status.success() {
            return Err(failure(CommandFailureKind::Status {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }));
        }
        Ok(())
    }

    fn build_args(
        &self,
        image: &ImageConfiguration,
        dockerfile: &Path,
        pull: bool,
        context: &BuildContext,
    ) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        if pull {
            args.push("--pull".to_string());
        }
        if context.no_cache {
            args.push("--no-cache".to_string());
        }
        args.extend(["-t".to_string(), image.name.clone()]);
        for (key, value) in &context.build_args {
            args.extend(["--build-arg".to_string(), format!("{}={}", key, value)]);
        }
        args.extend([
            "-f".to_string(),
            dockerfile.display().to_string(),
            context.context_dir.display().to_string(),
        ]);
        args
    }

    async fn dockerfile_for(
        &self,
        image: &ImageConfiguration,
        context: &BuildContext,
    ) -> Result<PathBuf, BuildError> {
        let build = image
            .build
            .as_ref()
            .ok_or_else(|| BuildError::MissingBuildConfiguration(image.name.clone()))?;
        if let Some(dockerfile) = &build.dockerfile {
            return Ok(context.context_dir.join(dockerfile));
        }

        let dir = context.work_dir.join(sanitize(&image.name));
        let prepare_err = |source| BuildError::Prepare {
            path: dir.clone(),
            source,
        };
        tokio::fs::create_dir_all(&dir).await.map_err(prepare_err)?;
        let path = dir.join("Dockerfile");
        tokio::fs::write(&path, dockerfile::render(build))
            .await
            .map_err(prepare_err)?;
        debug!("Rendered Dockerfile for {} at {}", image.name, path.display());
        Ok(path)
    }
}

#[async_trait]
impl BuildEngine for DockerCliEngine {
    async fn build_image(
        &self,
        image: &ImageConfiguration,
        pull: &PullDecision<'_>,
        context: &BuildContext,
    ) -> Result<(), BuildError> {
        let dockerfile = self.dockerfile_for(image, context).await?;

        if pull.required() {
            if let Some(auth) = &context.registry_auth {
                info!("Logging in to registry {} as {}", auth.registry, auth.username);
                let args = [
                    "login".to_string(),
                    auth.registry.clone(),
                    "--username".to_string(),
                    auth.username.clone(),
                    "--password-stdin".to_string(),
                ];
                self.run(&args, Some(auth.password.expose_secret())).await?;
            }
        }

        info!(
            "Building image {} (pull base image: {}, policy {})",
            image.name,
            pull.required(),
            pull.manager().policy()
        );
        let args = self.build_args(image, &dockerfile, pull.required(), context);
        self.run(&args, None).await?;
        pull.acknowledge()?;
        Ok(())
    }

    async fn tag_image(&self, name: &str, image: &ImageConfiguration) -> Result<(), TagError> {
        let tags = image
            .build
            .as_ref()
            .map(|b| b.tags.as_slice())
            .unwrap_or_default();
        if tags.is_empty() {
            return Ok(());
        }
        let reference = ImageReference::parse(name).map_err(|source| TagError::InvalidName {
            name: name.to_string(),
            source,
        })?;
        for tag in tags {
            let target = reference.with_tag(tag);
            info!("Tagging image {} as {}", name, target);
            self.run(&["tag".to_string(), name.to_string(), target], None)
                .await?;
        }
        Ok(())
    }
}

/// Directory name for an image, suffixed with a short digest of the full name
/// so names differing only in replaced characters stay apart.
fn sanitize(name: &str) -> String {
    let readable: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    format!("{}-{}", readable, &digest[..12])
}
